//! Configuration for the extraction pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::processing::{RetryConfig, SweepOptions, WorkerConfig, MAX_AGE_HOURS_LIMIT};
use crate::server::auth::TokenEntry;

/// Environment variable naming an optional TOML config file
pub const CONFIG_ENV_VAR: &str = "EXTRACT_PIPELINE_CONFIG";

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upload directories and validation limits
    #[serde(default)]
    pub uploads: UploadConfig,
    /// Per-identity admission control
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Retry policy applied around each worker run
    #[serde(default)]
    pub retry: RetryConfig,
    /// Worker process commands
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Stale temp-file sweeper
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Document store
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Static identity table
    #[serde(default)]
    pub auth: AuthConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `EXTRACT_PIPELINE_CONFIG`, or defaults
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    /// Reject settings that would make the pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_uploads == 0 {
            return Err(Error::Config("rate_limit.max_uploads must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(Error::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        if !SweepOptions::valid_max_age(self.cleanup.max_age_hours) {
            return Err(Error::Config(format!(
                "cleanup.max_age_hours must be between 0 and {}",
                MAX_AGE_HOURS_LIMIT
            )));
        }
        if self.uploads.temp_dir == self.uploads.storage_dir {
            // The sweeper would reap files awaiting the two-step process route
            return Err(Error::Config(
                "uploads.temp_dir and uploads.storage_dir must differ".into(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size for upload routes in bytes
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            max_upload_size: 12 * 1024 * 1024, // file limit plus multipart overhead
        }
    }
}

/// Upload storage and validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Scratch directory for per-run temp files (swept by age)
    pub temp_dir: PathBuf,
    /// Persistent directory for files awaiting the process route
    pub storage_dir: PathBuf,
    /// Maximum accepted file size in bytes (default: 10MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Accepted declared MIME type
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Institution name length bounds
    #[serde(default = "default_institution_min_len")]
    pub institution_min_len: usize,
    #[serde(default = "default_institution_max_len")]
    pub institution_max_len: usize,
    /// Earliest accepted reference year
    #[serde(default = "default_min_year")]
    pub min_year: i32,
}

fn default_max_file_size() -> u64 { 10 * 1024 * 1024 }
fn default_mime_type() -> String { "application/pdf".to_string() }
fn default_institution_min_len() -> usize { 3 }
fn default_institution_max_len() -> usize { 100 }
fn default_min_year() -> i32 { 2000 }

impl Default for UploadConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            temp_dir: base.join("uploads"),
            storage_dir: base.join("documents"),
            max_file_size: default_max_file_size(),
            mime_type: default_mime_type(),
            institution_min_len: default_institution_min_len(),
            institution_max_len: default_institution_max_len(),
            min_year: default_min_year(),
        }
    }
}

/// Sliding-window rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds (default: 15 minutes)
    pub window_secs: u64,
    /// Admissions allowed per identity per window
    pub max_uploads: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 15 * 60,
            max_uploads: 15,
        }
    }
}

/// Worker commands for the two flows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Streaming flow worker (free-form progress on stdout)
    pub stream: WorkerConfig,
    /// Two-step flow worker (JSON payload on stdout)
    pub extract: WorkerConfig,
    /// Ceiling on simultaneous worker processes (None = unbounded)
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            stream: WorkerConfig::script("scripts/run_pipeline.py", false),
            extract: WorkerConfig::script("scripts/process_pdf.py", true),
            max_concurrent: None,
        }
    }
}

/// Stale-file sweeper schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Run the periodic sweep
    pub enabled: bool,
    /// Seconds between sweeps (default: 1 hour)
    pub interval_secs: u64,
    /// Files older than this are reaped (default: 24 hours)
    pub max_age_hours: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            max_age_hours: 24.0,
        }
    }
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("documents.db"),
        }
    }
}

/// Identity collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Bearer tokens and the identities they resolve to
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

fn data_dir() -> PathBuf {
    // Use absolute path so relative working directories don't matter
    dirs::data_local_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
        .join("extract-pipeline")
}
