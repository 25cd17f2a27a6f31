//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::BackoffConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of items dispatched concurrently within one batch.
    pub batch_size: usize,
    /// Pause between consecutive batches of one pass.
    #[serde(with = "duration_ms")]
    pub inter_batch_delay: Duration,
    /// Failures after which an item is marked FAILED.
    pub max_retries: u32,
    /// Per-item backoff between failed attempts.
    pub backoff: BackoffConfig,
    /// Interval of the periodic trigger; `None` disables it.
    #[serde(with = "option_duration_ms")]
    pub periodic_interval: Option<Duration>,
    /// Settle time after connectivity comes back before a pass runs.
    #[serde(with = "duration_ms")]
    pub connectivity_debounce: Duration,
    /// Upper bound for a single remote call.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Keep SUCCEEDED items until `clear_completed` instead of dropping them.
    pub retain_completed: bool,
    /// Start a pass right after `enqueue` and `retry` when online.
    pub sync_on_enqueue: bool,
    /// Execution window granted by the background task host.
    #[serde(with = "duration_ms")]
    pub background_budget: Duration,
    /// Namespace for persisted keys.
    pub storage_prefix: String,
}

impl SyncConfig {
    /// Sets the batch size (clamped to at least 1).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the delay between batches.
    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    /// Sets the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets or disables the periodic trigger.
    pub fn with_periodic_interval(mut self, interval: Option<Duration>) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Sets the connectivity debounce.
    pub fn with_connectivity_debounce(mut self, debounce: Duration) -> Self {
        self.connectivity_debounce = debounce;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Keep succeeded items for auditing.
    pub fn with_retain_completed(mut self, retain: bool) -> Self {
        self.retain_completed = retain;
        self
    }

    /// Enable or disable the enqueue trigger.
    pub fn with_sync_on_enqueue(mut self, enabled: bool) -> Self {
        self.sync_on_enqueue = enabled;
        self
    }

    /// Sets the background execution window.
    pub fn with_background_budget(mut self, budget: Duration) -> Self {
        self.background_budget = budget;
        self
    }

    /// Sets the storage key prefix.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            inter_batch_delay: Duration::from_millis(100),
            max_retries: 5,
            backoff: BackoffConfig::default(),
            periodic_interval: Some(Duration::from_secs(30)),
            connectivity_debounce: Duration::from_millis(500),
            request_timeout: Duration::from_secs(15),
            retain_completed: false,
            sync_on_enqueue: true,
            background_budget: Duration::from_secs(25),
            storage_prefix: "fieldsync".to_string(),
        }
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an optional `Duration` as integer milliseconds or null.
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.inter_batch_delay, Duration::from_millis(100));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.periodic_interval, Some(Duration::from_secs(30)));
        assert!(!config.retain_completed);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"batch_size": 3, "periodic_interval": null}"#).unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.periodic_interval, None);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(SyncConfig::default()).unwrap();
        assert_eq!(json["inter_batch_delay"], 100);
        assert_eq!(json["periodic_interval"], 30_000);
        assert_eq!(json["backoff"]["max_delay"], 30_000);
    }

    #[test]
    fn test_builder_clamps() {
        let config = SyncConfig::default().with_batch_size(0).with_max_retries(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_retries, 1);
    }
}
