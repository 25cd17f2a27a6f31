//! Durable snapshots of the queue, statistics and id mappings.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use fieldsync_common::{Error, Result};
use fieldsync_storage::KeyValueStore;

use crate::state::{IdMap, SyncQueue};
use crate::stats::SyncStatistics;

/// Everything the engine persists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub queue: SyncQueue,
    pub stats: SyncStatistics,
    pub id_map: IdMap,
}

/// Borrowed form of `PersistedState` for writing.
#[derive(Serialize)]
struct Snapshot<'a> {
    queue: &'a SyncQueue,
    stats: &'a SyncStatistics,
    id_map: &'a IdMap,
}

/// Reads and writes engine state through a key-value store.
///
/// The whole state is one JSON blob under `{prefix}:state`, so a snapshot
/// is replaced in a single write and a crash never leaves the queue, the
/// counters and the id mappings out of step.
#[derive(Clone)]
pub struct QueueStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl QueueStore {
    /// Create a queue store writing under `prefix`.
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl AsRef<str>) -> Self {
        Self {
            store,
            key: format!("{}:state", prefix.as_ref()),
        }
    }

    /// Key the snapshot is stored under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load persisted state, recovering items left IN_FLIGHT by a crash.
    ///
    /// A snapshot that fails to parse is logged and replaced by empty state;
    /// a store that fails to read is an error.
    pub async fn load(&self) -> Result<PersistedState> {
        let mut state = match self.store.get(&self.key).await? {
            None => PersistedState::default(),
            Some(json) => match serde_json::from_str::<PersistedState>(&json) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Discarding unreadable {}: {}", self.key, e);
                    PersistedState::default()
                }
            },
        };

        let recovered = state.queue.recover_in_flight();
        if recovered > 0 {
            info!("Recovered {} in-flight items as pending", recovered);
            if let Err(e) = self.save(&state.queue, &state.stats, &state.id_map).await {
                error!("Failed to persist recovered queue: {}", e);
            }
        }

        info!(
            "Loaded sync queue from {} store: {} items",
            self.store.name(),
            state.queue.len()
        );
        Ok(state)
    }

    /// Persist a full snapshot in one write.
    pub async fn save(&self, queue: &SyncQueue, stats: &SyncStatistics, id_map: &IdMap) -> Result<()> {
        let snapshot = Snapshot {
            queue,
            stats,
            id_map,
        };
        let json =
            serde_json::to_string(&snapshot).map_err(|e| Error::Serialization(e.to_string()))?;
        self.store.set(&self.key, &json).await
    }
}
