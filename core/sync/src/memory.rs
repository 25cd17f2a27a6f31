//! In-memory remote entity client for testing.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use fieldsync_common::{Error, Result};

use crate::remote::{RemoteEntity, RemoteEntityClient};

/// A call observed by the memory client.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create { entity_type: String, payload: Value },
    Read { entity_type: String, id: String },
    Update { entity_type: String, id: String, payload: Value },
    Delete { entity_type: String, id: String },
}

impl RemoteCall {
    /// Whether this call would modify remote state.
    pub fn is_write(&self) -> bool {
        !matches!(self, RemoteCall::Read { .. })
    }
}

/// Injected failure for upcoming calls.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Transport failure.
    Network,
    /// Non-success status.
    Status(u16),
}

impl Fault {
    fn to_error(self) -> Error {
        match self {
            Fault::Network => Error::Network("connection reset".to_string()),
            Fault::Status(404) => Error::NotFound("entity not found".to_string()),
            Fault::Status(status) => Error::Remote {
                status,
                message: format!("injected status {}", status),
            },
        }
    }
}

#[derive(Default)]
struct RemoteState {
    entities: HashMap<(String, String), RemoteEntity>,
    next_id: u64,
    faults: VecDeque<Fault>,
    calls: Vec<RemoteCall>,
    latency: Option<Duration>,
}

/// In-memory stand-in for the remote API.
///
/// Stores entities per type, assigns ids `{prefix}{n}` on create, records
/// every call and can be told to fail upcoming calls.
pub struct MemoryEntityClient {
    state: Mutex<RemoteState>,
    id_prefix: String,
}

impl MemoryEntityClient {
    /// Create a new empty client that assigns ids `srv-1`, `srv-2`, ...
    pub fn new() -> Self {
        Self::with_id_prefix("srv-")
    }

    /// Create a client that assigns ids `{prefix}1`, `{prefix}2`, ...
    pub fn with_id_prefix(prefix: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            id_prefix: prefix.into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an entity as if another client had written it.
    pub fn insert(&self, entity_type: &str, entity: RemoteEntity) {
        let id = entity.id.clone().unwrap_or_default();
        self.lock()
            .entities
            .insert((entity_type.to_string(), id), entity);
    }

    /// Current server state of an entity.
    pub fn get(&self, entity_type: &str, id: &str) -> Option<RemoteEntity> {
        self.lock()
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned()
    }

    /// Fail the next `count` calls with `fault`.
    pub fn fail_next(&self, count: usize, fault: Fault) {
        let mut state = self.lock();
        for _ in 0..count {
            state.faults.push_back(fault);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// All calls observed so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Calls that would modify remote state.
    pub fn write_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_write()).count()
    }

    /// Record a call, then apply latency and any queued fault.
    async fn begin(&self, call: RemoteCall) -> Result<()> {
        let (latency, fault) = {
            let mut state = self.lock();
            state.calls.push(call);
            (state.latency, state.faults.pop_front())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn stamp(id: &str, payload: &Value) -> RemoteEntity {
        let now = Utc::now();
        let mut body = match payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert("id".to_string(), Value::String(id.to_string()));
        body.insert("updatedAt".to_string(), Value::String(now.to_rfc3339()));
        RemoteEntity::new(id, now, Value::Object(body))
    }
}

impl Default for MemoryEntityClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteEntityClient for MemoryEntityClient {
    async fn create(&self, entity_type: &str, payload: &Value) -> Result<RemoteEntity> {
        self.begin(RemoteCall::Create {
            entity_type: entity_type.to_string(),
            payload: payload.clone(),
        })
        .await?;

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("{}{}", self.id_prefix, state.next_id);
        let entity = Self::stamp(&id, payload);
        state
            .entities
            .insert((entity_type.to_string(), id), entity.clone());
        Ok(entity)
    }

    async fn read(&self, entity_type: &str, id: &str) -> Result<RemoteEntity> {
        self.begin(RemoteCall::Read {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        })
        .await?;

        self.get(entity_type, id)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", entity_type, id)))
    }

    async fn update(&self, entity_type: &str, id: &str, payload: &Value) -> Result<RemoteEntity> {
        self.begin(RemoteCall::Update {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            payload: payload.clone(),
        })
        .await?;

        let key = (entity_type.to_string(), id.to_string());
        let mut state = self.lock();
        if !state.entities.contains_key(&key) {
            return Err(Error::NotFound(format!("{}/{}", entity_type, id)));
        }
        let entity = Self::stamp(id, payload);
        state.entities.insert(key, entity.clone());
        Ok(entity)
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<()> {
        self.begin(RemoteCall::Delete {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        })
        .await?;

        self.lock()
            .entities
            .remove(&(entity_type.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{}/{}", entity_type, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_assigns_ids() {
        let client = MemoryEntityClient::with_id_prefix("T");
        let first = client.create("tasks", &json!({"title": "a"})).await.unwrap();
        let second = client.create("tasks", &json!({"title": "b"})).await.unwrap();
        assert_eq!(first.id.as_deref(), Some("T1"));
        assert_eq!(second.id.as_deref(), Some("T2"));
        assert_eq!(client.get("tasks", "T1").unwrap().data["title"], "a");
    }

    #[tokio::test]
    async fn test_missing_entities() {
        let client = MemoryEntityClient::new();
        assert!(client.read("tasks", "nope").await.unwrap_err().is_not_found());
        assert!(client
            .update("tasks", "nope", &json!({}))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(client.delete("tasks", "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let client = MemoryEntityClient::new();
        client.fail_next(1, Fault::Network);
        client.fail_next(1, Fault::Status(422));

        let first = client.create("tasks", &json!({})).await.unwrap_err();
        assert!(first.is_retryable());
        let second = client.create("tasks", &json!({})).await.unwrap_err();
        assert!(!second.is_retryable());
        assert!(client.create("tasks", &json!({})).await.is_ok());

        assert_eq!(client.write_count(), 3);
    }
}
