//! Local filesystem key-value store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use fieldsync_common::{Error, Result};
use crate::store::KeyValueStore;

/// Filesystem-backed key-value store.
///
/// Each key maps to one file under the root directory. Writes go to a
/// uniquely named temp file in the same directory and are renamed over the
/// target, so a crash leaves either the old blob or the new one.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a key to a file path.
    ///
    /// Keys may contain characters that are not valid in file names (the
    /// engine uses `prefix:name`), so anything outside `[A-Za-z0-9._-]` is
    /// replaced.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Store key cannot be empty".to_string()));
        }
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Ok(self.root.join(format!("{}.json", file_name)))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key)?;
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        fs::write(&tmp, value).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }

        debug!("Wrote {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        assert_eq!(store.get("fieldsync:state").await.unwrap(), None);
        store.set("fieldsync:state", "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get("fieldsync:state").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        {
            let store = FileStore::new(temp.path()).unwrap();
            store.set("stats", "42").await.unwrap();
        }
        let store = FileStore::new(temp.path()).unwrap();
        assert_eq!(store.get("stats").await.unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        store.set("k", "1").await.unwrap();
        store.set("k", "2").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        store.set("k", "1").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.delete("k").await.unwrap();
    }

    #[test]
    fn test_empty_key_rejected() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        assert!(store.key_path("").is_err());
    }

    #[test]
    fn test_creates_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nested").join("queue");
        let _store = FileStore::new(&root).unwrap();
        assert!(root.is_dir());
    }
}
