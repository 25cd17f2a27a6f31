//! Key-value store trait definition.

use async_trait::async_trait;

use fieldsync_common::Result;

/// Durable string storage keyed by name.
///
/// Implementations must make `set` atomic per key: after a crash a reader sees
/// either the previous value or the new one, never a torn write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// Returns `Ok(None)` when the key has never been written or was deleted.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
