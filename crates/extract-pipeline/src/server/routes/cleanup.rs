//! Manual temp-directory sweep

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::processing::{SweepOptions, MAX_AGE_HOURS_LIMIT};
use crate::server::auth::AuthenticatedUser;
use crate::server::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    #[serde(default)]
    pub dry_run: bool,
    pub max_age_hours: Option<f64>,
}

/// GET /api/cleanup - Sweep stale temp files (admin only)
pub async fn run_cleanup(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<serde_json::Value>> {
    if !identity.is_admin() {
        tracing::warn!("Cleanup denied for {}", identity.user_id);
        return Err(Error::Forbidden("cleanup requires the admin role".into()));
    }

    let max_age_hours = query.max_age_hours.unwrap_or(SweepOptions::default().max_age_hours);
    if !SweepOptions::valid_max_age(max_age_hours) {
        return Err(Error::validation(format!(
            "maxAgeHours: must be between 0 and {}",
            MAX_AGE_HOURS_LIMIT
        )));
    }

    let report = state
        .pipeline()
        .cleanup(SweepOptions {
            max_age_hours,
            dry_run: query.dry_run,
        })
        .await?;

    tracing::info!(
        "Cleanup by {}: {} scanned, {} deleted, {} bytes freed (dry run: {})",
        identity.user_id,
        report.result.files_scanned,
        report.result.files_deleted,
        report.result.bytes_freed,
        report.dry_run
    );

    Ok(Json(serde_json::json!({
        "success": true,
        "cleanup": report.result,
        "dryRun": report.dry_run,
        "maxAgeHours": report.max_age_hours,
        "stats": {
            "before": report.before,
            "after": report.after,
        }
    })))
}
