//! extract-pipeline: upload and extraction orchestrator
//!
//! Accepts PDF uploads, admits them through a per-user sliding-window rate
//! limiter, runs an external extraction worker under a retry policy and
//! streams its progress back to the caller. Document records move through
//! `uploaded -> processing -> processed -> saved` (or `error`) in a SQLite
//! store; stale temp files are swept periodically.

pub mod config;
pub mod error;
pub mod processing;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use processing::{Pipeline, ProgressStream, ProgressStreamer, RateLimiter, RetryPolicy};
pub use server::PipelineServer;
pub use storage::DocumentStore;
pub use types::{DocumentRecord, DocumentStatus, Identity, ProgressEvent};
