//! Common types used throughout fieldsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a queued mutation.
///
/// Generated once at enqueue time and stable for the lifetime of the item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ItemId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provenance attached to every mutation at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Device the mutation originated from.
    pub device_id: String,
    /// Signed-in user, if any.
    pub user_id: Option<String>,
}

impl SessionInfo {
    /// Create session info for a device and optional user.
    pub fn new(device_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id,
        }
    }
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_generate_unique() {
        let a = ItemId::generate();
        let b = ItemId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_item_id_empty_fails() {
        assert!(ItemId::new("").is_err());
        assert_eq!(ItemId::new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_item_id_serializes_as_string() {
        let id = ItemId::new("abc").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_default_session_has_device() {
        let session = SessionInfo::default();
        assert!(!session.device_id.is_empty());
        assert!(session.user_id.is_none());
    }
}
