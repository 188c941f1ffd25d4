//! Error types for the extraction pipeline

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::DocumentStatus;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad input shape, size or type
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Admission denied by the rate limiter
    #[error("Too many uploads, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Missing or invalid credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Status transition guard rejected the update
    #[error("Document {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: DocumentStatus,
        to: DocumentStatus,
    },

    /// Uniqueness conflict on save
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Worker process could not be started
    #[error("Failed to start worker: {0}")]
    WorkerSpawn(String),

    /// Worker exited non-zero, reported a flagged error line or timed out
    #[error("Worker failed: {0}")]
    WorkerExecution(String),

    /// Worker success payload could not be parsed
    #[error("Failed to parse worker payload: {0}")]
    Parse(String),

    /// Store unreachable or query failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a worker execution error
    pub fn worker(message: impl Into<String>) -> Self {
        Self::WorkerExecution(message.into())
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the retry policy should attempt the operation again.
    ///
    /// Every worker-side failure is retried uniformly; the worker does not
    /// distinguish bad input from transient faults.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WorkerSpawn(_) | Error::WorkerExecution(_) | Error::Parse(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            Error::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                self.to_string(),
            ),
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone()),
            Error::DocumentNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Document not found: {}", id),
            ),
            Error::InvalidTransition { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_transition", self.to_string())
            }
            Error::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            Error::WorkerSpawn(msg) => (StatusCode::BAD_GATEWAY, "worker_spawn_error", msg.clone()),
            Error::WorkerExecution(msg) => {
                (StatusCode::BAD_GATEWAY, "worker_error", msg.clone())
            }
            Error::Parse(msg) => (StatusCode::BAD_GATEWAY, "parse_error", msg.clone()),
            Error::Persistence(msg) => {
                tracing::error!("Persistence failure: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "persistence_error",
                    "Document store unavailable".to_string(),
                )
            }
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        let mut response = (status, body).into_response();
        if let Error::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_errors_are_retryable() {
        assert!(Error::WorkerSpawn("not found".into()).is_retryable());
        assert!(Error::worker("exit 1").is_retryable());
        assert!(Error::Parse("eof".into()).is_retryable());
        assert!(!Error::validation("year").is_retryable());
        assert!(!Error::persistence("locked").is_retryable());
        assert!(!Error::RateLimited { retry_after_secs: 5 }.is_retryable());
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = Error::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let response = Error::Conflict("saved twice".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
