//! Application state for the pipeline server

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::processing::{spawn_sweeper, Pipeline, RateLimiter, WorkerProcessRunner, WorkerRunner};
use crate::server::auth::{IdentityProvider, StaticTokenProvider};
use crate::storage::DocumentStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: PipelineConfig,
    /// Upload and extraction orchestrator
    pipeline: Pipeline,
    /// Token to identity resolution
    identity: Arc<dyn IdentityProvider>,
    /// Ready state
    ready: RwLock<bool>,
    /// Periodic temp-file sweeper
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Create application state backed by the configured database and
    /// real worker processes
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        tracing::info!("Initializing pipeline state...");

        let store = Arc::new(DocumentStore::new(&config.database.path)?);
        tracing::info!("Document store opened at {}", config.database.path.display());

        let identity = Arc::new(StaticTokenProvider::from_config(&config.auth));
        Self::with_components(config, store, Arc::new(WorkerProcessRunner::new()), identity).await
    }

    /// Create application state from explicit collaborators
    pub async fn with_components(
        config: PipelineConfig,
        store: Arc<DocumentStore>,
        runner: Arc<dyn WorkerRunner>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let pipeline = Pipeline::new(&config, store, limiter.clone(), runner);
        pipeline.ensure_dirs().await?;

        let sweeper = if config.cleanup.enabled {
            tracing::info!(
                "Temp sweeper every {}s for files older than {}h",
                config.cleanup.interval_secs,
                config.cleanup.max_age_hours
            );
            Some(spawn_sweeper(
                pipeline.temp_dir().to_path_buf(),
                config.cleanup.clone(),
                limiter,
            ))
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                pipeline,
                identity,
                ready: RwLock::new(true),
                sweeper: Mutex::new(sweeper),
            }),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Get the orchestrator
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Get the identity provider
    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.inner.identity
    }

    /// Check if the server is ready
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Set ready state
    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}

impl Drop for AppStateInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
