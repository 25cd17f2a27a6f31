//! Typed lifecycle events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use fieldsync_common::ItemId;

use crate::conflict::ConflictPolicy;
use crate::engine::PassResult;
use crate::state::Operation;

/// Something observable happened to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ItemAdded {
        item_id: ItemId,
        operation: Operation,
        entity_type: String,
    },
    ItemSyncing {
        item_id: ItemId,
    },
    ItemSynced {
        item_id: ItemId,
        /// Server id of the affected entity, when known.
        entity_id: Option<String>,
    },
    ItemFailed {
        item_id: ItemId,
        error: String,
        retry_count: u32,
        /// The error class suggests another attempt could succeed.
        retryable: bool,
        /// The item is now FAILED and will not be retried automatically.
        terminal: bool,
    },
    ConflictResolved {
        item_id: ItemId,
        entity_type: String,
        entity_id: String,
        resolution: ConflictPolicy,
    },
    IdMapped {
        temp_id: String,
        entity_id: String,
    },
    SyncStart {
        eligible: usize,
    },
    SyncComplete {
        result: PassResult,
    },
}

impl SyncEvent {
    /// Stable event name, e.g. `item:added`.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::ItemAdded { .. } => "item:added",
            SyncEvent::ItemSyncing { .. } => "item:syncing",
            SyncEvent::ItemSynced { .. } => "item:synced",
            SyncEvent::ItemFailed { .. } => "item:failed",
            SyncEvent::ConflictResolved { .. } => "conflict:resolved",
            SyncEvent::IdMapped { .. } => "id:mapped",
            SyncEvent::SyncStart { .. } => "sync:start",
            SyncEvent::SyncComplete { .. } => "sync:complete",
        }
    }
}

/// Fan-out of events to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; the engine never blocks
/// on them.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: SyncEvent) {
        trace!("event {}", event.name());
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
