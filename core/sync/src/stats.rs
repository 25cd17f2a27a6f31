//! Aggregate sync statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters kept across passes and process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatistics {
    /// Items applied (or made moot by the server).
    pub total_synced: u64,
    /// Items that exhausted their retries.
    pub total_failed: u64,
    /// Conflicts detected and resolved by policy.
    pub conflicts_resolved: u64,
    /// Start of the most recent pass that actually ran.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Running mean of pass durations.
    pub average_duration_ms: f64,
    /// Passes folded into the average.
    pub pass_count: u64,
}

impl SyncStatistics {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a completed pass into the running average.
    pub fn record_pass(&mut self, started_at: DateTime<Utc>, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.pass_count += 1;
        self.average_duration_ms += (ms - self.average_duration_ms) / self.pass_count as f64;
        self.last_sync_at = Some(started_at);
    }

    pub fn record_synced(&mut self) {
        self.total_synced += 1;
    }

    pub fn record_failed(&mut self) {
        self.total_failed += 1;
    }

    pub fn record_conflict(&mut self) {
        self.conflicts_resolved += 1;
    }
}
