//! Document lifecycle endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::ProcessReport;
use crate::server::auth::AuthenticatedUser;
use crate::server::state::AppState;
use crate::types::{DocumentRecord, DocumentStatus};

/// Query parameters for listing
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// Response for listing documents
#[derive(Debug, Serialize)]
pub struct ListDocumentsResponse {
    pub documents: Vec<DocumentRecord>,
    pub total: usize,
}

/// GET /api/documents - List visible documents, optionally by status
pub async fn list_documents(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListDocumentsResponse>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            DocumentStatus::parse(raw)
                .ok_or_else(|| Error::validation(format!("status: unknown value {}", raw)))?,
        ),
    };

    let documents = state.pipeline().list_documents(&identity, status)?;
    let total = documents.len();
    Ok(Json(ListDocumentsResponse { documents, total }))
}

/// GET /api/documents/:id - Get one document
pub async fn get_document(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentRecord>> {
    Ok(Json(state.pipeline().get_document(&identity, id)?))
}

/// DELETE /api/documents/:id - Delete a document and its stored file
pub async fn delete_document(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let removed = state.pipeline().delete_document(&identity, id).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "id": removed.id,
    })))
}

/// POST /api/documents/:id/process - Run extraction on an uploaded document
///
/// Answers 200 with the report when the run succeeds and 502 with the same
/// report when every attempt failed.
pub async fn process_document(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ProcessReport>)> {
    let report = state.pipeline().process_document(&identity, id).await?;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(report)))
}

/// POST /api/documents/:id/save - Approve extracted data
pub async fn save_document(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(approved): Json<serde_json::Value>,
) -> Result<Json<DocumentRecord>> {
    if approved.is_null() {
        return Err(Error::validation("body: approved data is required"));
    }
    Ok(Json(state.pipeline().save_document(&identity, id, &approved)?))
}
