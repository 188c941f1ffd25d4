//! Persisted document record and its status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a document record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Stored, waiting for extraction
    Uploaded,
    /// An extraction run owns the record
    Processing,
    /// Extraction finished, awaiting review
    Processed,
    /// Approved and promoted to a final record
    Saved,
    /// Extraction failed after all retries
    Error,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 5] = [
        DocumentStatus::Uploaded,
        DocumentStatus::Processing,
        DocumentStatus::Processed,
        DocumentStatus::Saved,
        DocumentStatus::Error,
    ];

    /// Statuses from which `self` may be entered
    pub fn sources(self) -> impl Iterator<Item = DocumentStatus> {
        Self::ALL.into_iter().filter(move |from| from.can_transition_to(self))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Saved => "saved",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(DocumentStatus::Uploaded),
            "processing" => Some(DocumentStatus::Processing),
            "processed" => Some(DocumentStatus::Processed),
            "saved" => Some(DocumentStatus::Saved),
            "error" => Some(DocumentStatus::Error),
            _ => None,
        }
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Uploaded, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Processed)
                | (DocumentStatus::Processing, DocumentStatus::Error)
                | (DocumentStatus::Processed, DocumentStatus::Saved)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable document record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: Uuid,
    pub status: DocumentStatus,
    /// Institution name as submitted
    pub institution: String,
    /// Normalized institution key used for access control and uniqueness
    pub institution_code: String,
    pub year: i32,
    /// Original (unsanitized) file name
    pub original_name: String,
    /// Where the worker reads the file from
    pub stored_path: PathBuf,
    /// Uploading identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_data: Option<serde_json::Value>,
    /// Last error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fields needed to create a record
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub institution: String,
    pub institution_code: String,
    pub year: i32,
    pub original_name: String,
    pub stored_path: PathBuf,
    pub uploaded_by: Option<String>,
}

impl DocumentRecord {
    /// Build a fresh record in `uploaded`
    pub fn uploaded(new: NewDocument) -> Self {
        Self::fresh(new, DocumentStatus::Uploaded)
    }

    /// Build a fresh record already claimed by a run
    pub fn processing(new: NewDocument) -> Self {
        Self::fresh(new, DocumentStatus::Processing)
    }

    fn fresh(new: NewDocument, status: DocumentStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            institution: new.institution,
            institution_code: new.institution_code,
            year: new.year,
            original_name: new.original_name,
            stored_path: new.stored_path,
            uploaded_by: new.uploaded_by,
            uploaded_at: Utc::now(),
            processed_at: None,
            saved_at: None,
            extracted_data: None,
            normalized_data: None,
            error: None,
        }
    }
}
