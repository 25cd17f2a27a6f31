//! Queue items and the in-memory queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use fieldsync_common::{Error, ItemId, Result, SessionInfo};

use crate::conflict::ConflictPolicy;

/// Kind of mutation carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        };
        f.pad(name)
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation: {}", other))),
        }
    }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Waiting for a pass.
    Pending,
    /// Being dispatched by the current pass.
    InFlight,
    /// Applied remotely (or made moot by the server).
    Succeeded,
    /// Retries exhausted; waits for `retry` or `clear`.
    Failed,
}

/// Dispatch priority. Orders work, never drops it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::InvalidInput(format!("Unknown priority: {}", other))),
        }
    }
}

/// One pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: ItemId,
    pub operation: Operation,
    pub entity_type: String,
    /// Server id of the target entity. Absent for CREATE.
    pub entity_id: Option<String>,
    /// Local placeholder id of an entity created offline, reconciled with
    /// the server id once the CREATE lands.
    #[serde(default)]
    pub temp_id: Option<String>,
    pub payload: Value,
    /// Also the client version timestamp used for conflict detection.
    pub enqueued_at: DateTime<Utc>,
    /// Enqueue order, breaks ties between equal timestamps.
    #[serde(default)]
    pub seq: u64,
    pub retry_count: u32,
    pub status: ItemStatus,
    pub last_error: Option<String>,
    pub priority: Priority,
    pub conflict_policy: Option<ConflictPolicy>,
    pub device_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncItem {
    /// Create a new PENDING item stamped with the session's provenance.
    pub fn new(
        operation: Operation,
        entity_type: impl Into<String>,
        payload: Value,
        session: &SessionInfo,
    ) -> Self {
        Self {
            id: ItemId::generate(),
            operation,
            entity_type: entity_type.into(),
            entity_id: None,
            temp_id: None,
            payload,
            enqueued_at: Utc::now(),
            seq: 0,
            retry_count: 0,
            status: ItemStatus::Pending,
            last_error: None,
            priority: Priority::default(),
            conflict_policy: None,
            device_id: session.device_id.clone(),
            user_id: session.user_id.clone(),
            completed_at: None,
        }
    }

    /// Mark as being dispatched.
    pub fn mark_in_flight(&mut self) {
        self.status = ItemStatus::InFlight;
    }

    /// Mark as applied.
    pub fn mark_succeeded(&mut self) {
        self.status = ItemStatus::Succeeded;
        self.last_error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` when the retry budget is exhausted and the item is
    /// now FAILED.
    pub fn record_failure(&mut self, error: impl Into<String>, max_retries: u32) -> bool {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        if self.retry_count >= max_retries {
            self.status = ItemStatus::Failed;
            true
        } else {
            self.status = ItemStatus::Pending;
            false
        }
    }

    /// Put a FAILED item back in line with a fresh retry budget.
    pub fn reset_for_retry(&mut self) {
        self.status = ItemStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
    }

    /// Turn an UPDATE of a remotely deleted entity into a CREATE.
    ///
    /// The former id becomes the placeholder so queued edits of the same
    /// record follow the recreated entity.
    pub fn reclassify_as_create(&mut self) {
        self.operation = Operation::Create;
        if let Some(old_id) = self.entity_id.take() {
            self.temp_id = Some(old_id);
        }
    }
}

/// Temporary-to-server id mappings recorded by successful CREATEs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap(HashMap<String, String>);

impl IdMap {
    /// Record that `temp_id` is now known as `server_id`.
    pub fn insert(&mut self, temp_id: impl Into<String>, server_id: impl Into<String>) {
        self.0.insert(temp_id.into(), server_id.into());
    }

    /// Resolve an id through the mapping, following chains.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        let mut current = id;
        // Bounded by the map size so a cycle can't spin forever
        for _ in 0..=self.0.len() {
            match self.0.get(current) {
                Some(next) if next != current => current = next.as_str(),
                _ => break,
            }
        }
        current
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// All queued items, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncQueue {
    items: HashMap<ItemId, SyncItem>,
    #[serde(default)]
    next_seq: u64,
}

impl SyncQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item, assigning its enqueue sequence number.
    pub fn insert(&mut self, mut item: SyncItem) {
        self.next_seq += 1;
        item.seq = self.next_seq;
        self.items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &ItemId) -> Option<&SyncItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut SyncItem> {
        self.items.get_mut(id)
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<SyncItem> {
        self.items.remove(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get all items.
    pub fn items(&self) -> impl Iterator<Item = &SyncItem> {
        self.items.values()
    }

    /// Items with the given status in dispatch order.
    pub fn with_status(&self, status: ItemStatus) -> Vec<&SyncItem> {
        let mut items: Vec<&SyncItem> =
            self.items.values().filter(|i| i.status == status).collect();
        sort_for_dispatch(&mut items);
        items
    }

    /// PENDING items in dispatch order, excluding those waiting on a queued
    /// CREATE of the entity they reference.
    pub fn dispatchable(&self) -> Vec<&SyncItem> {
        self.with_status(ItemStatus::Pending)
            .into_iter()
            .filter(|item| !self.is_blocked(item))
            .collect()
    }

    /// Whether `item` targets a placeholder id whose CREATE is still queued.
    pub fn is_blocked(&self, item: &SyncItem) -> bool {
        if item.operation == Operation::Create {
            return false;
        }
        let Some(entity_id) = item.entity_id.as_deref() else {
            return false;
        };
        self.items.values().any(|other| {
            other.id != item.id
                && other.operation == Operation::Create
                && other.status != ItemStatus::Succeeded
                && other.temp_id.as_deref() == Some(entity_id)
        })
    }

    /// Point every item referencing `temp_id` at `server_id`.
    pub fn remap_entity_id(&mut self, temp_id: &str, server_id: &str) -> usize {
        let mut changed = 0;
        for item in self.items.values_mut() {
            if item.entity_id.as_deref() == Some(temp_id) {
                item.entity_id = Some(server_id.to_string());
                changed += 1;
            }
        }
        changed
    }

    /// Reset items left IN_FLIGHT by an interrupted process.
    pub fn recover_in_flight(&mut self) -> usize {
        let mut recovered = 0;
        for item in self.items.values_mut() {
            if item.status == ItemStatus::InFlight {
                item.status = ItemStatus::Pending;
                recovered += 1;
            }
        }
        recovered
    }

    /// Drop all SUCCEEDED items.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|_, i| i.status != ItemStatus::Succeeded);
        before - self.items.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Count items by status.
    pub fn count_by_status(&self) -> HashMap<ItemStatus, usize> {
        let mut counts = HashMap::new();
        for item in self.items.values() {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        counts
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Priority descending, then oldest first.
fn sort_for_dispatch(items: &mut [&SyncItem]) {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.enqueued_at.cmp(&b.enqueued_at))
            .then(a.seq.cmp(&b.seq))
    });
}
