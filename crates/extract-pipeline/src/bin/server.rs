//! Extraction pipeline server binary
//!
//! Run with: cargo run -p extract-pipeline --bin extract-pipeline-server

use extract_pipeline::{config::PipelineConfig, server::PipelineServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extract_pipeline=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = PipelineConfig::load()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Temp dir: {}", config.uploads.temp_dir.display());
    tracing::info!("  - Storage dir: {}", config.uploads.storage_dir.display());
    tracing::info!("  - Database: {}", config.database.path.display());
    tracing::info!(
        "  - Rate limit: {} uploads / {}s",
        config.rate_limit.max_uploads,
        config.rate_limit.window_secs
    );
    tracing::info!(
        "  - Retry: {} attempts, {}ms base delay",
        config.retry.max_attempts,
        config.retry.base_delay_ms
    );
    tracing::info!("  - Stream worker: {}", config.workers.stream.program);
    tracing::info!("  - Extract worker: {}", config.workers.extract.program);

    let server = PipelineServer::new(config).await?;

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
