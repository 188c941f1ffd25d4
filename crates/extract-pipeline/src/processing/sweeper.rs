//! Periodic removal of orphaned temporary files

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use super::RateLimiter;
use crate::config::CleanupConfig;
use crate::error::Result;

/// Largest accepted age threshold (ten years)
pub const MAX_AGE_HOURS_LIMIT: f64 = 10.0 * 365.0 * 24.0;

/// Options for one sweep
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOptions {
    pub max_age_hours: f64,
    pub dry_run: bool,
}

impl SweepOptions {
    /// Whether `max_age_hours` is a usable threshold
    pub fn valid_max_age(max_age_hours: f64) -> bool {
        max_age_hours.is_finite() && (0.0..=MAX_AGE_HOURS_LIMIT).contains(&max_age_hours)
    }
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            max_age_hours: 24.0,
            dry_run: false,
        }
    }
}

/// Result of one sweep; in dry-run mode the deleted counters report what
/// would have been removed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub files_scanned: u64,
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// File count and size of one directory (regular files only)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStats {
    pub file_count: u64,
    pub total_size: u64,
    #[serde(rename = "totalSizeMB")]
    pub total_size_mb: String,
}

/// Delete files in `dir` older than `options.max_age_hours`.
///
/// Subdirectories are skipped. Per-file failures are collected and the sweep
/// carries on. A missing directory yields an empty report.
pub async fn sweep(dir: &Path, options: SweepOptions) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!("Sweep skipped, directory does not exist: {}", dir.display());
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    let max_age = max_age(options.max_age_hours);
    let now = SystemTime::now();

    while let Some(entry) = entries.next_entry().await? {
        report.files_scanned += 1;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if let Err(e) = sweep_entry(&path, now, max_age, options.dry_run, &mut report).await {
            let message = format!("Failed to process {}: {}", name, e);
            tracing::error!("File cleanup error: {}", message);
            report.errors.push(message);
        }
    }

    tracing::info!(
        "Cleanup completed in {}: scanned={}, deleted={}, freed={} bytes, errors={}, dry_run={}",
        dir.display(),
        report.files_scanned,
        report.files_deleted,
        report.bytes_freed,
        report.errors.len(),
        options.dry_run
    );

    Ok(report)
}

/// Age threshold; thresholds beyond what `Duration` can hold match no file
fn max_age(hours: f64) -> Duration {
    Duration::try_from_secs_f64((hours * 3600.0).max(0.0)).unwrap_or(Duration::MAX)
}

async fn sweep_entry(
    path: &Path,
    now: SystemTime,
    max_age: Duration,
    dry_run: bool,
    report: &mut SweepReport,
) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        return Ok(());
    }

    let age = now.duration_since(meta.modified()?).unwrap_or(Duration::ZERO);
    if age <= max_age {
        return Ok(());
    }

    let age_hours = age.as_secs_f64() / 3600.0;
    if dry_run {
        tracing::info!(
            "Would delete {} (dry run, {:.2}h old, {} bytes)",
            path.display(),
            age_hours,
            meta.len()
        );
    } else {
        tokio::fs::remove_file(path).await?;
        tracing::info!(
            "Deleted old file {} ({:.2}h old, {} bytes)",
            path.display(),
            age_hours,
            meta.len()
        );
    }

    report.files_deleted += 1;
    report.bytes_freed += meta.len();
    Ok(())
}

/// Count regular files and their total size; a missing directory is empty
pub async fn directory_stats(dir: &Path) -> Result<DirectoryStats> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stats(0, 0)),
        Err(e) => return Err(e.into()),
    };

    let (mut count, mut total) = (0u64, 0u64);
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            count += 1;
            total += meta.len();
        }
    }
    Ok(stats(count, total))
}

fn stats(file_count: u64, total_size: u64) -> DirectoryStats {
    DirectoryStats {
        file_count,
        total_size,
        total_size_mb: format!("{:.2}", total_size as f64 / (1024.0 * 1024.0)),
    }
}

/// Sweep `dir` every `config.interval_secs` and prune idle rate-limit windows
pub fn spawn_sweeper(dir: PathBuf, config: CleanupConfig, limiter: Arc<RateLimiter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Cleanup sweeper started for {} (every {:?}, max age {}h)",
            dir.display(),
            period,
            config.max_age_hours
        );

        loop {
            ticker.tick().await;

            let options = SweepOptions {
                max_age_hours: config.max_age_hours,
                dry_run: false,
            };
            if let Err(e) = sweep(&dir, options).await {
                tracing::error!("Periodic sweep of {} failed: {}", dir.display(), e);
            }

            let pruned = limiter.prune_idle();
            if pruned > 0 {
                tracing::debug!("Pruned {} idle rate-limit windows", pruned);
            }
        }
    })
}
