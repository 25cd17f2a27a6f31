//! Remote entity client trait definition.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_common::{Error, Result};

/// Field names accepted as an entity's last-modified timestamp.
const TIMESTAMP_FIELDS: &[&str] = &["updatedAt", "updated_at", "lastModified"];

/// Server-side state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    /// Server-assigned id, when the response carries one.
    pub id: Option<String>,
    /// Server's own last-modified time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Full entity body as returned by the server.
    pub data: Value,
}

impl RemoteEntity {
    /// Create an entity with a known id and timestamp.
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            updated_at: Some(updated_at),
            data,
        }
    }

    /// Decode an entity from a JSON response body.
    ///
    /// `id` may be a string or a number. The timestamp may be an RFC 3339
    /// string or epoch milliseconds.
    pub fn from_json(data: Value) -> Self {
        let id = match data.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let updated_at = TIMESTAMP_FIELDS
            .iter()
            .filter_map(|field| data.get(*field))
            .find_map(parse_timestamp);

        Self {
            id,
            updated_at,
            data,
        }
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// CRUD access to the remote API for named entity types.
///
/// Implementations must classify failures through the common error type:
/// `Error::NotFound` (or `Remote { status: 404 }`) for missing entities,
/// `Remote { status }` for other HTTP-like failures and `Network`/`Timeout`
/// for transport problems. The engine derives retry behavior from that.
#[async_trait]
pub trait RemoteEntityClient: Send + Sync {
    /// Create an entity; the response may carry the server-assigned id.
    async fn create(&self, entity_type: &str, payload: &Value) -> Result<RemoteEntity>;

    /// Read the current state of an entity.
    async fn read(&self, entity_type: &str, id: &str) -> Result<RemoteEntity>;

    /// Replace an entity's state.
    async fn update(&self, entity_type: &str, id: &str, payload: &Value) -> Result<RemoteEntity>;

    /// Delete an entity.
    async fn delete(&self, entity_type: &str, id: &str) -> Result<()>;
}

/// Bounds every call of an inner client by a fixed timeout.
pub struct TimeoutClient {
    inner: Arc<dyn RemoteEntityClient>,
    timeout: Duration,
}

impl TimeoutClient {
    pub fn new(inner: Arc<dyn RemoteEntityClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        what: String,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} after {:?}", what, self.timeout))),
        }
    }
}

#[async_trait]
impl RemoteEntityClient for TimeoutClient {
    async fn create(&self, entity_type: &str, payload: &Value) -> Result<RemoteEntity> {
        self.bounded(
            format!("create {}", entity_type),
            self.inner.create(entity_type, payload),
        )
        .await
    }

    async fn read(&self, entity_type: &str, id: &str) -> Result<RemoteEntity> {
        self.bounded(
            format!("read {}/{}", entity_type, id),
            self.inner.read(entity_type, id),
        )
        .await
    }

    async fn update(&self, entity_type: &str, id: &str, payload: &Value) -> Result<RemoteEntity> {
        self.bounded(
            format!("update {}/{}", entity_type, id),
            self.inner.update(entity_type, id, payload),
        )
        .await
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<()> {
        self.bounded(
            format!("delete {}/{}", entity_type, id),
            self.inner.delete(entity_type, id),
        )
        .await
    }
}
