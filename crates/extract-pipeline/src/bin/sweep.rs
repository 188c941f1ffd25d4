//! One-shot sweep of stale upload temp files
//!
//! Run with: cargo run -p extract-pipeline --features cli --bin extract-pipeline-sweep -- --dry-run

use clap::Parser;
use extract_pipeline::{
    config::PipelineConfig,
    processing::{directory_stats, sweep, SweepOptions, MAX_AGE_HOURS_LIMIT},
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "extract-pipeline-sweep", version, about = "Delete stale upload temp files")]
struct Cli {
    /// Directory to sweep (default: the configured temp dir)
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Files older than this many hours are removed
    #[arg(long, default_value_t = 24.0)]
    max_age_hours: f64,
    /// Report what would be removed without deleting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "extract_pipeline=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if !SweepOptions::valid_max_age(cli.max_age_hours) {
        anyhow::bail!("--max-age-hours must be between 0 and {}", MAX_AGE_HOURS_LIMIT);
    }

    let dir = match cli.dir {
        Some(dir) => dir,
        None => PipelineConfig::load()?.uploads.temp_dir,
    };

    let before = directory_stats(&dir).await?;
    let report = sweep(
        &dir,
        SweepOptions {
            max_age_hours: cli.max_age_hours,
            dry_run: cli.dry_run,
        },
    )
    .await?;
    let after = directory_stats(&dir).await?;

    let output = serde_json::json!({
        "directory": dir.display().to_string(),
        "dryRun": cli.dry_run,
        "cleanup": report,
        "stats": { "before": before, "after": after },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if !report.errors.is_empty() {
        tracing::warn!("{} files could not be removed", report.errors.len());
    }
    Ok(())
}
