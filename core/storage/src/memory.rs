//! In-memory key-value store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fieldsync_common::{Error, Result};
use crate::store::KeyValueStore;

/// In-memory key-value store.
///
/// All data is lost on drop. Clones share the same underlying map, which lets
/// tests simulate a process restart by building a second engine on a clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
    /// Remaining writes before the store turns read-only; `None` is unlimited.
    writes_left: Arc<RwLock<Option<usize>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`delete` fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.set_writes_left(if fail { Some(0) } else { None });
    }

    /// Allow `writes` more `set`/`delete` calls, then fail every later one.
    pub fn fail_after_writes(&self, writes: usize) {
        self.set_writes_left(Some(writes));
    }

    fn set_writes_left(&self, writes: Option<usize>) {
        if let Ok(mut left) = self.writes_left.write() {
            *left = writes;
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        let mut left = self.writes_left.write().map_err(|_| Self::poisoned())?;
        match left.as_mut() {
            None => Ok(()),
            Some(0) => Err(Error::Storage("memory store is read-only".to_string())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
        }
    }

    fn poisoned() -> Error {
        Error::Storage("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store.set("queue", "[]").await.unwrap();
        assert_eq!(store.get("queue").await.unwrap().as_deref(), Some("[]"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "1").await.unwrap();
        store.set("k", "2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));

        store.delete("k").await.unwrap();
        assert!(store.is_empty());
        // Deleting again is fine
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", "v").await.unwrap();
        assert_eq!(other.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.set_fail_writes(true);

        assert!(matches!(store.set("k", "w").await, Err(Error::Storage(_))));
        // Reads still work and see the last good value
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.set_fail_writes(false);
        store.set("k", "w").await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_after_writes() {
        let store = MemoryStore::new();
        store.fail_after_writes(1);

        store.set("a", "1").await.unwrap();
        assert!(matches!(store.set("b", "2").await, Err(Error::Storage(_))));
        assert!(matches!(store.delete("a").await, Err(Error::Storage(_))));
        assert_eq!(store.len(), 1);
    }
}
