//! Processing module: admission, worker execution and run orchestration

pub mod pipeline;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
pub mod sweeper;
pub mod temp_file;
pub mod worker;

pub use pipeline::{Admission, CleanupReport, Pipeline, PipelineRun, ProcessReport, RunOutcome};
pub use progress::{ProgressStream, ProgressStreamer};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryConfig, RetryPolicy};
pub use sweeper::{
    directory_stats, spawn_sweeper, sweep, DirectoryStats, SweepOptions, SweepReport,
    MAX_AGE_HOURS_LIMIT,
};
pub use temp_file::{TempFile, TempFileManager};
pub use worker::{
    WorkerCommand, WorkerConfig, WorkerLine, WorkerOutcome, WorkerPayload, WorkerProcessRunner,
    WorkerRunner,
};
