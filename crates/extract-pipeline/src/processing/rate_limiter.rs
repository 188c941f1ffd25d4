//! Per-identity sliding-window admission control

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Sliding-window rate limiter keyed by identity.
///
/// Each identity's timestamp list is mutated under its map-shard lock, so
/// prune, check and record happen atomically per identity.
pub struct RateLimiter {
    windows: DashMap<String, Vec<Instant>>,
    window: Duration,
    limit: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            limit,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window(), config.max_uploads)
    }

    /// Admit and record one action for `identity` now
    pub fn check_and_record(&self, identity: &str) -> bool {
        self.check_and_record_at(identity, Instant::now())
    }

    /// Admit and record one action for `identity` at `now`
    pub fn check_and_record_at(&self, identity: &str, now: Instant) -> bool {
        let mut entries = self.windows.entry(identity.to_string()).or_default();
        let window = self.window;
        entries.retain(|ts| now.saturating_duration_since(*ts) < window);

        if entries.len() >= self.limit {
            return false;
        }

        entries.push(now);
        true
    }

    /// Time until the oldest admission in the window expires
    pub fn retry_after(&self, identity: &str) -> Duration {
        self.retry_after_at(identity, Instant::now())
    }

    pub fn retry_after_at(&self, identity: &str, now: Instant) -> Duration {
        self.windows
            .get(identity)
            .and_then(|entries| entries.first().copied())
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or(Duration::ZERO)
    }

    /// Drop identities with no admissions left in the window
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let window = self.window;
        self.windows.retain(|_, entries| {
            entries.retain(|ts| now.saturating_duration_since(*ts) < window);
            !entries.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities currently tracked
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
