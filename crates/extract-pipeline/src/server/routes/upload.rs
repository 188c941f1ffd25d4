//! Upload endpoints: the streaming flow and step one of the two-step flow

use axum::{
    extract::{Multipart, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::{Stream, StreamExt};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::server::auth::AuthenticatedUser;
use crate::server::state::AppState;
use crate::types::{DocumentRecord, UploadRequest};

/// Multipart field names
const FIELD_FILE: &str = "file";
const FIELD_INSTITUTION: &str = "institutionName";
const FIELD_YEAR: &str = "year";

/// POST /api/documents/process-pdf - Upload a PDF and stream extraction progress
pub async fn process_pdf(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    multipart: Multipart,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    // A throttled caller is turned away before its body is read
    let admission = state.pipeline().admit(identity)?;

    let (request, bytes) = read_upload(multipart).await?;
    tracing::info!(
        "Streaming upload from {}: {} ({} bytes)",
        admission.identity().user_id,
        request.file_name,
        bytes.len()
    );

    let progress = state
        .pipeline()
        .submit_stream(admission, request, &bytes)
        .await?;

    let events = progress.map(|event| Event::default().json_data(event));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// POST /api/documents/upload - Store a PDF for later processing
pub async fn upload_document(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    multipart: Multipart,
) -> Result<Json<DocumentRecord>> {
    let (request, bytes) = read_upload(multipart).await?;
    let record = state
        .pipeline()
        .upload_document(&identity, request, &bytes)
        .await?;
    Ok(Json(record))
}

/// Collect the file and its metadata fields; unknown fields are ignored
async fn read_upload(mut multipart: Multipart) -> Result<(UploadRequest, Vec<u8>)> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut institution = String::new();
    let mut year = String::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        Error::validation(format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            FIELD_FILE => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let mime_type = field.content_type().unwrap_or("").to_string();
                let data = field.bytes().await.map_err(|e| {
                    Error::validation(format!("Failed to read file: {}", e))
                })?;
                file = Some((file_name, mime_type, data.to_vec()));
            }
            FIELD_INSTITUTION | FIELD_YEAR => {
                let text = field.text().await.map_err(|e| {
                    Error::validation(format!("Failed to read {}: {}", name, e))
                })?;
                if name == FIELD_INSTITUTION {
                    institution = text;
                } else {
                    year = text;
                }
            }
            _ => {
                tracing::debug!("Ignoring multipart field {}", name);
            }
        }
    }

    let (file_name, mime_type, bytes) =
        file.ok_or_else(|| Error::validation("file: no file provided"))?;

    let request = UploadRequest {
        file_name,
        file_size: bytes.len() as u64,
        mime_type,
        institution,
        year,
    };
    Ok((request, bytes))
}
