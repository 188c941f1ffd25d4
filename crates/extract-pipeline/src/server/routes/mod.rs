//! API routes for the pipeline server

pub mod cleanup;
pub mod documents;
pub mod upload;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Uploads - with larger body limit for multipart
        .route(
            "/documents/process-pdf",
            post(upload::process_pdf).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route(
            "/documents/upload",
            post(upload::upload_document).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        // Document lifecycle
        .route("/documents", get(documents::list_documents))
        .route(
            "/documents/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route("/documents/:id/process", post(documents::process_document))
        .route("/documents/:id/save", post(documents::save_document))
        // Maintenance
        .route("/cleanup", get(cleanup::run_cleanup))
        // Info
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "extract-pipeline",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "PDF upload and extraction pipeline with live progress",
        "endpoints": {
            "POST /api/documents/process-pdf": "Upload a PDF and stream extraction progress (SSE)",
            "POST /api/documents/upload": "Store a PDF for later processing",
            "POST /api/documents/:id/process": "Run extraction on an uploaded document",
            "POST /api/documents/:id/save": "Approve extracted data",
            "GET /api/documents": "List documents (?status=)",
            "GET /api/documents/:id": "Get document details",
            "DELETE /api/documents/:id": "Delete a document",
            "GET /api/cleanup": "Sweep stale temp files (admin, ?dryRun=&maxAgeHours=)"
        },
        "features": {
            "rate_limiting": "Sliding window per user",
            "retries": "Exponential backoff around each worker run",
            "streaming": "Worker output forwarded as server-sent events",
            "cleanup": "Periodic sweep of stale temp files"
        }
    }))
}
