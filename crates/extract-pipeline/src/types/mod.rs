//! Core types for the extraction pipeline

pub mod document;
pub mod identity;
pub mod progress;
pub mod upload;

pub use document::{DocumentRecord, DocumentStatus, NewDocument};
pub use identity::{AccessLevel, Identity, Role};
pub use progress::{LineKind, ProgressEvent};
pub use upload::{check_pdf_magic, institution_code, sanitize_filename, UploadRequest, ValidatedUpload};
