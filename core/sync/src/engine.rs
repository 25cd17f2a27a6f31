//! Core sync engine that owns the queue and runs sync passes.

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use fieldsync_common::{Error, ItemId, Result, SessionInfo};
use fieldsync_storage::KeyValueStore;

use crate::config::SyncConfig;
use crate::conflict::{ConflictPolicy, ConflictResolver};
use crate::events::{EventBus, SyncEvent};
use crate::network::NetworkMonitor;
use crate::queue_store::QueueStore;
use crate::remote::{RemoteEntityClient, TimeoutClient};
use crate::state::{IdMap, ItemStatus, Operation, SyncItem, SyncQueue};
use crate::stats::SyncStatistics;

/// Optional attributes of an enqueued mutation.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Target entity. For CREATE this is the local placeholder id.
    pub entity_id: Option<String>,
    pub priority: crate::state::Priority,
    /// Overrides the entity type's default conflict policy.
    pub conflict_policy: Option<ConflictPolicy>,
}

impl EnqueueOptions {
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: crate::state::Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = Some(policy);
        self
    }
}

/// Counts for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassResult {
    /// Items that reached SUCCEEDED.
    pub synced: usize,
    /// Dispatch attempts that failed (retrying or exhausted).
    pub failed: usize,
    /// Of `failed`, items that are now FAILED.
    pub exhausted: usize,
    pub duration_ms: u64,
}

impl PassResult {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Synced => self.synced += 1,
            DispatchOutcome::Retrying => self.failed += 1,
            DispatchOutcome::Exhausted => {
                self.failed += 1;
                self.exhausted += 1;
            }
            DispatchOutcome::Skipped => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Synced,
    Retrying,
    Exhausted,
    /// Item vanished or changed state before dispatch.
    Skipped,
}

/// What a successful dispatch did remotely.
#[derive(Debug)]
enum Applied {
    /// A write went through. Carries the id pair for CREATE reconciliation.
    Written {
        entity_id: Option<String>,
        temp_id: Option<String>,
    },
    /// SERVER_WINS: the server keeps its state, nothing was written.
    ServerKept,
    /// DELETE of an entity the server no longer has.
    AlreadyDeleted,
}

struct EngineState {
    queue: SyncQueue,
    stats: SyncStatistics,
    id_map: IdMap,
    /// Earliest time a failed item may be dispatched again.
    backoff: HashMap<ItemId, Instant>,
}

struct EngineInner {
    remote: Arc<dyn RemoteEntityClient>,
    network: Arc<dyn NetworkMonitor>,
    store: QueueStore,
    resolver: ConflictResolver,
    state: RwLock<EngineState>,
    syncing: AtomicBool,
    /// A pass was requested while another was running.
    rerun_requested: AtomicBool,
    events: EventBus,
    session: std::sync::RwLock<SessionInfo>,
    config: SyncConfig,
}

/// Clears the re-entrancy flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Main sync engine for delivering queued mutations.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open the engine over persisted state.
    ///
    /// Items left IN_FLIGHT by a previous process are reset to PENDING.
    pub async fn open(
        remote: Arc<dyn RemoteEntityClient>,
        store: Arc<dyn KeyValueStore>,
        network: Arc<dyn NetworkMonitor>,
        resolver: ConflictResolver,
        config: SyncConfig,
    ) -> Result<Self> {
        let store = QueueStore::new(store, config.storage_prefix.clone());
        let persisted = store.load().await?;
        let remote: Arc<dyn RemoteEntityClient> =
            Arc::new(TimeoutClient::new(remote, config.request_timeout));

        Ok(Self {
            inner: Arc::new(EngineInner {
                remote,
                network,
                store,
                resolver,
                state: RwLock::new(EngineState {
                    queue: persisted.queue,
                    stats: persisted.stats,
                    id_map: persisted.id_map,
                    backoff: HashMap::new(),
                }),
                syncing: AtomicBool::new(false),
                rerun_requested: AtomicBool::new(false),
                events: EventBus::default(),
                session: std::sync::RwLock::new(SessionInfo::default()),
                config,
            }),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Get the network monitor the engine consults.
    pub fn network(&self) -> Arc<dyn NetworkMonitor> {
        self.inner.network.clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.network.is_online()
    }

    /// Whether a pass is running right now.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Set the provenance stamped onto subsequently enqueued items.
    pub fn set_session(&self, session: SessionInfo) {
        if let Ok(mut current) = self.inner.session.write() {
            *current = session;
        }
    }

    pub fn session(&self) -> SessionInfo {
        self.inner
            .session
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Apply a state change and persist the resulting snapshot.
    ///
    /// The snapshot is written while the state lock is held so writes reach
    /// the store in mutation order. A failed write leaves the engine running
    /// from memory.
    async fn mutate<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.inner.state.write().await;
        let result = f(&mut *state);
        if let Err(e) = self
            .inner
            .store
            .save(&state.queue, &state.stats, &state.id_map)
            .await
        {
            error!("Failed to persist sync queue, continuing in memory: {}", e);
        }
        result
    }

    /// Queue a mutation for delivery.
    ///
    /// Persists immediately and never touches the network itself. When
    /// online and idle a pass is started in the background.
    ///
    /// # Errors
    /// - Empty entity type
    /// - UPDATE or DELETE without an entity id
    pub async fn enqueue(
        &self,
        operation: Operation,
        entity_type: impl Into<String>,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<ItemId> {
        let entity_type = entity_type.into();
        if entity_type.is_empty() {
            return Err(Error::InvalidInput("Entity type cannot be empty".to_string()));
        }
        if operation != Operation::Create && options.entity_id.is_none() {
            return Err(Error::InvalidInput(format!(
                "{} of {} requires an entity id",
                operation, entity_type
            )));
        }

        let mut item = SyncItem::new(operation, entity_type.clone(), payload, &self.session());
        item.priority = options.priority;
        item.conflict_policy = options.conflict_policy;
        match operation {
            Operation::Create => item.temp_id = options.entity_id,
            _ => item.entity_id = options.entity_id,
        }
        let id = item.id.clone();

        self.mutate(|state| state.queue.insert(item)).await;
        debug!("Enqueued {} {} as {}", operation, entity_type, id);

        self.inner.events.emit(SyncEvent::ItemAdded {
            item_id: id.clone(),
            operation,
            entity_type,
        });

        if self.inner.config.sync_on_enqueue {
            self.trigger_pass();
        }
        Ok(id)
    }

    /// Start a pass in the background when online.
    ///
    /// While a pass is running the request is remembered and served once
    /// that pass ends.
    fn trigger_pass(&self) {
        if !self.is_online() {
            return;
        }
        if self.is_syncing() {
            self.inner.rerun_requested.store(true, Ordering::Release);
            return;
        }
        tokio::spawn(self.clone().pass_future());
    }

    /// Boxed so timers and triggers can spawn passes from inside a pass.
    fn pass_future(self) -> BoxFuture<'static, PassResult> {
        Box::pin(async move { self.run_pass().await })
    }

    /// Re-run a pass once `delay` has elapsed.
    fn schedule_retry(&self, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.pass_future().await;
        });
    }

    /// Run one sync pass over all currently eligible items.
    ///
    /// No-op if a pass is already running or the network is unavailable.
    pub async fn run_pass(&self) -> PassResult {
        self.run_pass_until(None).await
    }

    /// Manually requested pass. Same guards as `run_pass`.
    pub async fn force_sync(&self) -> PassResult {
        info!("Forced sync requested");
        self.run_pass().await
    }

    /// Pass that stops starting new batches once `budget` has elapsed.
    ///
    /// Batches already started always finish, so nothing is abandoned
    /// mid-dispatch; undispatched items stay PENDING.
    pub async fn run_background_pass(&self, budget: Duration) -> PassResult {
        self.run_pass_until(Some(Instant::now() + budget)).await
    }

    async fn run_pass_until(&self, deadline: Option<Instant>) -> PassResult {
        if !self.is_online() {
            debug!("Skipping sync pass: offline");
            return PassResult::default();
        }
        let Some(guard) = PassGuard::acquire(&self.inner.syncing) else {
            debug!("Sync pass already running, queueing a rerun");
            self.inner.rerun_requested.store(true, Ordering::Release);
            return PassResult::default();
        };

        let start = Instant::now();
        let started_at = Utc::now();

        let eligible: Vec<ItemId> = {
            let state = self.inner.state.read().await;
            state
                .queue
                .dispatchable()
                .into_iter()
                .filter(|item| {
                    state
                        .backoff
                        .get(&item.id)
                        .map(|until| *until <= start)
                        .unwrap_or(true)
                })
                .map(|item| item.id.clone())
                .collect()
        };

        let batch_size = self.inner.config.batch_size.max(1);
        let batch_count = eligible.len().div_ceil(batch_size);
        info!(
            "Starting sync pass: {} eligible items in {} batches",
            eligible.len(),
            batch_count
        );
        self.inner.events.emit(SyncEvent::SyncStart {
            eligible: eligible.len(),
        });

        let mut result = PassResult::default();
        for (index, batch) in eligible.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inner.config.inter_batch_delay).await;
            }
            if !self.is_online() {
                warn!(
                    "Connectivity lost, stopping pass after {} of {} batches",
                    index, batch_count
                );
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                info!(
                    "Execution window elapsed, leaving {} batches for the next pass",
                    batch_count - index
                );
                break;
            }

            let outcomes = join_all(batch.iter().map(|id| self.dispatch(id))).await;
            for outcome in outcomes {
                result.record(outcome);
            }
        }

        let duration = start.elapsed();
        result.duration_ms = duration.as_millis() as u64;
        self.mutate(|state| state.stats.record_pass(started_at, duration))
            .await;

        info!(
            "Sync pass completed in {:?}: {} synced, {} failed ({} exhausted)",
            duration, result.synced, result.failed, result.exhausted
        );
        self.inner.events.emit(SyncEvent::SyncComplete {
            result: result.clone(),
        });

        drop(guard);
        if self.inner.rerun_requested.swap(false, Ordering::AcqRel) {
            debug!("Pass requested while running, starting a follow-up pass");
            self.trigger_pass();
        } else if deadline.is_none()
            && self.inner.config.sync_on_enqueue
            && self.has_new_work(&eligible).await
        {
            debug!("Work became eligible during the pass, starting a follow-up pass");
            self.trigger_pass();
        }
        result
    }

    /// Whether items outside `seen` are ready now, e.g. edits unblocked by an
    /// id mapping or mutations enqueued mid-pass.
    async fn has_new_work(&self, seen: &[ItemId]) -> bool {
        let now = Instant::now();
        let state = self.inner.state.read().await;
        state.queue.dispatchable().into_iter().any(|item| {
            !seen.contains(&item.id)
                && state
                    .backoff
                    .get(&item.id)
                    .map(|until| *until <= now)
                    .unwrap_or(true)
        })
    }

    /// Dispatch one item and record the outcome.
    async fn dispatch(&self, id: &ItemId) -> DispatchOutcome {
        let item = self
            .mutate(|state| {
                let item = state.queue.get_mut(id)?;
                if item.status != ItemStatus::Pending {
                    return None;
                }
                item.mark_in_flight();
                Some(item.clone())
            })
            .await;
        let Some(item) = item else {
            return DispatchOutcome::Skipped;
        };

        debug!(
            "Dispatching {} {} ({}, attempt {})",
            item.operation,
            item.entity_type,
            item.id,
            item.retry_count + 1
        );
        self.inner.events.emit(SyncEvent::ItemSyncing {
            item_id: item.id.clone(),
        });

        match self.execute(&item).await {
            Ok(applied) => self.complete(&item, applied).await,
            Err(e) => self.fail(&item, e).await,
        }
    }

    /// Conflict check plus the remote write.
    async fn execute(&self, item: &SyncItem) -> Result<Applied> {
        let remote = self.inner.remote.as_ref();
        let mut operation = item.operation;
        let mut payload = item.payload.clone();
        let mut temp_id = item.temp_id.clone();
        let entity_id = item.entity_id.clone();

        if let Some(entity_id) = entity_id.as_deref() {
            let outcome = self
                .inner
                .resolver
                .check(
                    remote,
                    &item.entity_type,
                    entity_id,
                    &payload,
                    item.enqueued_at,
                    item.conflict_policy,
                )
                .await;

            if outcome.remote_missing {
                if operation == Operation::Delete {
                    debug!("{}/{} already gone remotely", item.entity_type, entity_id);
                    return Ok(Applied::AlreadyDeleted);
                }
                temp_id = self.reclassify_as_create(item).await;
                operation = Operation::Create;
            } else if outcome.has_conflict {
                self.mutate(|state| state.stats.record_conflict()).await;
                self.inner.events.emit(SyncEvent::ConflictResolved {
                    item_id: item.id.clone(),
                    entity_type: item.entity_type.clone(),
                    entity_id: entity_id.to_string(),
                    resolution: outcome.resolution,
                });
                match outcome.resolution {
                    ConflictPolicy::ClientWins => {}
                    ConflictPolicy::ServerWins => return Ok(Applied::ServerKept),
                    ConflictPolicy::Merge => {
                        if let Some(merged) = outcome.merged_payload {
                            payload = merged;
                        }
                    }
                }
            }
        }

        match (operation, entity_id) {
            (Operation::Create, _) => {
                let created = remote.create(&item.entity_type, &payload).await?;
                Ok(Applied::Written {
                    entity_id: created.id,
                    temp_id,
                })
            }
            (operation, None) => Err(Error::InvalidInput(format!(
                "{} of {} without entity id",
                operation, item.entity_type
            ))),
            (Operation::Update, Some(entity_id)) => {
                match remote.update(&item.entity_type, &entity_id, &payload).await {
                    Ok(_) => Ok(Applied::Written {
                        entity_id: Some(entity_id),
                        temp_id: None,
                    }),
                    Err(e) if e.is_not_found() => {
                        // Deleted between the check and the write
                        let temp_id = self.reclassify_as_create(item).await;
                        let created = remote.create(&item.entity_type, &payload).await?;
                        Ok(Applied::Written {
                            entity_id: created.id,
                            temp_id,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            (Operation::Delete, Some(entity_id)) => {
                match remote.delete(&item.entity_type, &entity_id).await {
                    Ok(()) => Ok(Applied::Written {
                        entity_id: Some(entity_id),
                        temp_id: None,
                    }),
                    Err(e) if e.is_not_found() => Ok(Applied::AlreadyDeleted),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Persist an UPDATE-to-CREATE reclassification; returns the placeholder id.
    async fn reclassify_as_create(&self, item: &SyncItem) -> Option<String> {
        info!(
            "{}/{} no longer exists remotely, recreating it ({})",
            item.entity_type,
            item.entity_id.as_deref().unwrap_or("?"),
            item.id
        );
        self.mutate(|state| {
            state.queue.get_mut(&item.id).and_then(|queued| {
                queued.reclassify_as_create();
                queued.temp_id.clone()
            })
        })
        .await
        .or_else(|| item.entity_id.clone())
    }

    async fn complete(&self, item: &SyncItem, applied: Applied) -> DispatchOutcome {
        let retain = self.inner.config.retain_completed;
        let (entity_id, mapping) = match applied {
            Applied::Written { entity_id, temp_id } => {
                let mapping = match (temp_id, entity_id.clone()) {
                    (Some(temp), Some(real)) if temp != real => Some((temp, real)),
                    _ => None,
                };
                (entity_id, mapping)
            }
            Applied::ServerKept => {
                debug!("Server state kept for {}, nothing written", item.id);
                (item.entity_id.clone(), None)
            }
            Applied::AlreadyDeleted => (item.entity_id.clone(), None),
        };

        let found = self
            .mutate(|state| {
                let Some(queued) = state.queue.get_mut(&item.id) else {
                    return false;
                };
                queued.mark_succeeded();
                if let Some(real) = entity_id.as_ref() {
                    queued.entity_id = Some(real.clone());
                }
                state.stats.record_synced();
                state.backoff.remove(&item.id);
                if let Some((temp, real)) = mapping.as_ref() {
                    state.id_map.insert(temp.clone(), real.clone());
                    let remapped = state.queue.remap_entity_id(temp, real);
                    debug!("Mapped {} -> {} ({} queued items updated)", temp, real, remapped);
                }
                if !retain {
                    state.queue.remove(&item.id);
                }
                true
            })
            .await;

        if !found {
            debug!("Item {} was cleared during dispatch", item.id);
            return DispatchOutcome::Skipped;
        }

        if let Some((temp, real)) = mapping {
            self.inner.events.emit(SyncEvent::IdMapped {
                temp_id: temp,
                entity_id: real,
            });
        }
        self.inner.events.emit(SyncEvent::ItemSynced {
            item_id: item.id.clone(),
            entity_id,
        });
        DispatchOutcome::Synced
    }

    async fn fail(&self, item: &SyncItem, err: Error) -> DispatchOutcome {
        let retryable = err.is_retryable();
        let message = err.to_string();
        let max_retries = self.inner.config.max_retries;
        let backoff = &self.inner.config.backoff;

        let recorded = self
            .mutate(|state| {
                let queued = state.queue.get_mut(&item.id)?;
                let exhausted = queued.record_failure(message.clone(), max_retries);
                let retry_count = queued.retry_count;
                if exhausted {
                    state.stats.record_failed();
                    state.backoff.remove(&item.id);
                    Some((retry_count, None))
                } else {
                    let delay = backoff.delay_for_attempt(retry_count);
                    state.backoff.insert(item.id.clone(), Instant::now() + delay);
                    Some((retry_count, Some(delay)))
                }
            })
            .await;

        let Some((retry_count, delay)) = recorded else {
            return DispatchOutcome::Skipped;
        };

        self.inner.events.emit(SyncEvent::ItemFailed {
            item_id: item.id.clone(),
            error: message.clone(),
            retry_count,
            retryable,
            terminal: delay.is_none(),
        });

        match delay {
            Some(delay) => {
                warn!(
                    "Attempt {} for {} failed ({}): {}. Retrying in {:?}",
                    retry_count,
                    item.id,
                    if retryable { "retryable" } else { "terminal" },
                    message,
                    delay
                );
                self.schedule_retry(delay);
                DispatchOutcome::Retrying
            }
            None => {
                error!(
                    "Giving up on {} {} ({}) after {} attempts: {}",
                    item.operation, item.entity_type, item.id, retry_count, message
                );
                DispatchOutcome::Exhausted
            }
        }
    }

    /// Put one FAILED item back in line.
    ///
    /// Returns `false` if the item does not exist or is not FAILED.
    pub async fn retry(&self, id: &ItemId) -> bool {
        let reset = self
            .mutate(|state| match state.queue.get_mut(id) {
                Some(item) if item.status == ItemStatus::Failed => {
                    item.reset_for_retry();
                    state.backoff.remove(id);
                    true
                }
                _ => false,
            })
            .await;

        if reset {
            info!("Retrying failed item {}", id);
            self.trigger_pass();
        }
        reset
    }

    /// Put every FAILED item back in line; returns how many were reset.
    pub async fn retry_all(&self) -> usize {
        let count = self
            .mutate(|state| {
                let failed: Vec<ItemId> = state
                    .queue
                    .with_status(ItemStatus::Failed)
                    .iter()
                    .map(|item| item.id.clone())
                    .collect();
                for id in &failed {
                    if let Some(item) = state.queue.get_mut(id) {
                        item.reset_for_retry();
                    }
                    state.backoff.remove(id);
                }
                failed.len()
            })
            .await;

        if count > 0 {
            info!("Retrying {} failed items", count);
            self.trigger_pass();
        }
        count
    }

    /// Items not yet delivered (PENDING or IN_FLIGHT), in dispatch order.
    pub async fn pending_items(&self) -> Vec<SyncItem> {
        let state = self.inner.state.read().await;
        let mut items: Vec<SyncItem> = state
            .queue
            .with_status(ItemStatus::InFlight)
            .into_iter()
            .cloned()
            .collect();
        items.extend(
            state
                .queue
                .with_status(ItemStatus::Pending)
                .into_iter()
                .cloned(),
        );
        items
    }

    /// Items that exhausted their retries.
    pub async fn failed_items(&self) -> Vec<SyncItem> {
        let state = self.inner.state.read().await;
        state
            .queue
            .with_status(ItemStatus::Failed)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every item in the queue regardless of status.
    pub async fn all_items(&self) -> Vec<SyncItem> {
        let state = self.inner.state.read().await;
        state.queue.items().cloned().collect()
    }

    pub async fn item(&self, id: &ItemId) -> Option<SyncItem> {
        self.inner.state.read().await.queue.get(id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        let state = self.inner.state.read().await;
        state
            .queue
            .items()
            .filter(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::InFlight))
            .count()
    }

    /// Number of queued items per status.
    pub async fn status_counts(&self) -> HashMap<ItemStatus, usize> {
        self.inner.state.read().await.queue.count_by_status()
    }

    pub async fn statistics(&self) -> SyncStatistics {
        self.inner.state.read().await.stats.clone()
    }

    /// Server id for an id that may be a temporary placeholder.
    pub async fn resolve_id(&self, id: &str) -> String {
        self.inner.state.read().await.id_map.resolve(id).to_string()
    }

    /// Drop SUCCEEDED items kept for auditing.
    pub async fn clear_completed(&self) -> usize {
        let removed = self.mutate(|state| state.queue.clear_completed()).await;
        debug!("Cleared {} completed items", removed);
        removed
    }

    /// Discard every queued item, including pending backoff bookkeeping.
    ///
    /// Irreversible. Statistics and id mappings are kept.
    pub async fn clear(&self) {
        let dropped = self
            .mutate(|state| {
                let count = state.queue.len();
                state.queue.clear();
                state.backoff.clear();
                count
            })
            .await;
        warn!("Cleared sync queue, {} items discarded", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryEntityClient, RemoteCall};
    use crate::network::ManualNetworkMonitor;
    use crate::remote::RemoteEntity;
    use crate::state::Priority;
    use fieldsync_storage::MemoryStore;
    use serde_json::json;

    struct Harness {
        engine: SyncEngine,
        remote: Arc<MemoryEntityClient>,
        network: Arc<ManualNetworkMonitor>,
        store: MemoryStore,
    }

    async fn harness(config: SyncConfig) -> Harness {
        let remote = Arc::new(MemoryEntityClient::with_id_prefix("T"));
        let network = Arc::new(ManualNetworkMonitor::new(true));
        let store = MemoryStore::new();
        let engine = SyncEngine::open(
            remote.clone(),
            Arc::new(store.clone()),
            network.clone(),
            ConflictResolver::standard(),
            config,
        )
        .await
        .unwrap();
        Harness {
            engine,
            remote,
            network,
            store,
        }
    }

    fn manual() -> SyncConfig {
        SyncConfig::default()
            .with_sync_on_enqueue(false)
            .with_inter_batch_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_enqueue_validates_input() {
        let h = harness(manual()).await;
        let missing_type = h
            .engine
            .enqueue(Operation::Create, "", json!({}), EnqueueOptions::default())
            .await;
        assert!(matches!(missing_type, Err(Error::InvalidInput(_))));

        let missing_id = h
            .engine
            .enqueue(Operation::Update, "tasks", json!({}), EnqueueOptions::default())
            .await;
        assert!(matches!(missing_id, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_enqueue_stamps_session_and_persists() {
        let h = harness(manual()).await;
        h.engine
            .set_session(SessionInfo::new("tablet-7", Some("u-1".to_string())));

        let id = h
            .engine
            .enqueue(
                Operation::Create,
                "tasks",
                json!({"title": "Paint wall"}),
                EnqueueOptions::default().with_priority(Priority::High),
            )
            .await
            .unwrap();

        let item = h.engine.item(&id).await.unwrap();
        assert_eq!(item.device_id, "tablet-7");
        assert_eq!(item.user_id.as_deref(), Some("u-1"));
        assert_eq!(item.priority, Priority::High);

        let raw = h.store.get("fieldsync:state").await.unwrap().unwrap();
        assert!(raw.contains(id.as_str()));
    }

    #[tokio::test]
    async fn test_offline_pass_is_noop() {
        let h = harness(manual()).await;
        h.network.set_online(false);
        h.engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let result = h.engine.run_pass().await;
        assert_eq!(result, PassResult::default());
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.engine.pending_count().await, 1);
        assert_eq!(h.engine.statistics().await.pass_count, 0);
    }

    #[tokio::test]
    async fn test_priority_order_within_pass() {
        let h = harness(manual().with_batch_size(1)).await;
        h.engine
            .enqueue(
                Operation::Create,
                "tasks",
                json!({"name": "B"}),
                EnqueueOptions::default().with_priority(Priority::Low),
            )
            .await
            .unwrap();
        h.engine
            .enqueue(
                Operation::Create,
                "tasks",
                json!({"name": "A"}),
                EnqueueOptions::default().with_priority(Priority::High),
            )
            .await
            .unwrap();

        let result = h.engine.run_pass().await;
        assert_eq!(result.synced, 2);

        let names: Vec<Value> = h
            .remote
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Create { payload, .. } => Some(payload["name"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec![json!("A"), json!("B")]);
    }

    #[tokio::test]
    async fn test_update_of_deleted_entity_becomes_create() {
        let h = harness(manual()).await;
        let id = h
            .engine
            .enqueue(
                Operation::Update,
                "tasks",
                json!({"status": "DONE"}),
                EnqueueOptions::entity("T40"),
            )
            .await
            .unwrap();

        let result = h.engine.run_pass().await;
        assert_eq!(result.synced, 1);
        assert!(h.engine.item(&id).await.is_none());
        assert_eq!(h.remote.get("tasks", "T1").unwrap().data["status"], "DONE");
        // Later edits of the old id follow the recreated entity
        assert_eq!(h.engine.resolve_id("T40").await, "T1");
    }

    #[tokio::test]
    async fn test_server_wins_skips_write() {
        let h = harness(manual()).await;
        h.remote.insert(
            "attendance",
            RemoteEntity::new(
                "A1",
                Utc::now() + chrono::Duration::hours(1),
                json!({"clock_in": "08:00"}),
            ),
        );
        let mut events = h.engine.subscribe();

        h.engine
            .enqueue(
                Operation::Update,
                "attendance",
                json!({"clock_in": "08:05"}),
                EnqueueOptions::entity("A1"),
            )
            .await
            .unwrap();
        let result = h.engine.run_pass().await;

        assert_eq!(result.synced, 1);
        assert_eq!(h.remote.write_count(), 0);
        assert_eq!(h.engine.statistics().await.conflicts_resolved, 1);

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::ConflictResolved { resolution, .. } = event {
                assert_eq!(resolution, ConflictPolicy::ServerWins);
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);
    }

    #[tokio::test]
    async fn test_temp_id_mapping() {
        let h = harness(manual()).await;
        let create = h
            .engine
            .enqueue(
                Operation::Create,
                "tasks",
                json!({"title": "Lay tiles"}),
                EnqueueOptions::entity("tmp-1"),
            )
            .await
            .unwrap();
        let update = h
            .engine
            .enqueue(
                Operation::Update,
                "tasks",
                json!({"status": "DONE"}),
                EnqueueOptions::entity("tmp-1").with_priority(Priority::High),
            )
            .await
            .unwrap();

        // The update waits for the create even though it ranks higher
        let first = h.engine.run_pass().await;
        assert_eq!(first.synced, 1);
        assert!(h.engine.item(&create).await.is_none());
        let pending = h.engine.item(&update).await.unwrap();
        assert_eq!(pending.entity_id.as_deref(), Some("T1"));
        assert_eq!(h.engine.resolve_id("tmp-1").await, "T1");

        let second = h.engine.run_pass().await;
        assert_eq!(second.synced, 1);
        assert_eq!(h.remote.get("tasks", "T1").unwrap().data["status"], "DONE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_waits_for_backoff() {
        let h = harness(manual()).await;
        h.remote.fail_next(1, Fault::Status(503));
        let id = h
            .engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let first = h.engine.run_pass().await;
        assert_eq!(first.failed, 1);
        let item = h.engine.item(&id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert!(item.last_error.is_some());

        // Not eligible before its backoff elapses
        let early = h.engine.run_pass().await;
        assert_eq!(early.synced + early.failed, 0);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        // The scheduled retry pass has picked it up by now
        assert!(h.engine.item(&id).await.is_none());
        assert_eq!(h.engine.statistics().await.total_synced, 1);
    }

    #[tokio::test]
    async fn test_terminal_errors_still_count_retries() {
        let h = harness(manual().with_max_retries(1)).await;
        h.remote.fail_next(1, Fault::Status(422));
        let id = h
            .engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let result = h.engine.run_pass().await;
        assert_eq!(result.exhausted, 1);
        let item = h.engine.item(&id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(h.engine.failed_items().await.len(), 1);

        let mut events = h.engine.subscribe();
        assert!(h.engine.retry(&id).await);
        assert!(!h.engine.retry(&id).await);

        // Retrying starts a pass on its own
        loop {
            if let Ok(SyncEvent::SyncComplete { result }) = events.recv().await {
                assert_eq!(result.synced, 1);
                break;
            }
        }
        assert!(h.engine.item(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_due_during_pass_runs_after_it() {
        let h = harness(manual().with_batch_size(1)).await;
        h.remote.set_latency(Duration::from_secs(1));
        h.remote.fail_next(1, Fault::Status(503));

        let first = h
            .engine
            .enqueue(
                Operation::Create,
                "tasks",
                json!({"name": "A"}),
                EnqueueOptions::default().with_priority(Priority::High),
            )
            .await
            .unwrap();
        for name in ["B", "C", "D"] {
            h.engine
                .enqueue(
                    Operation::Create,
                    "tasks",
                    json!({ "name": name }),
                    EnqueueOptions::default(),
                )
                .await
                .unwrap();
        }

        // A fails at 1s and its retry falls due while B, C and D are still in flight
        let result = h.engine.run_pass().await;
        assert_eq!(result.synced, 3);
        assert_eq!(result.failed, 1);
        assert!(h.engine.item(&first).await.is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.engine.item(&first).await.is_none());
        let stats = h.engine.statistics().await;
        assert_eq!(stats.pass_count, 2);
        assert_eq!(stats.total_synced, 4);
    }

    #[tokio::test]
    async fn test_pass_requested_while_running_is_not_dropped() {
        let h = harness(manual()).await;
        h.remote.set_latency(Duration::from_millis(50));
        h.engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let engine = h.engine.clone();
        let mut events = engine.subscribe();
        let pass = tokio::spawn(async move { engine.run_pass().await });
        while !h.engine.is_syncing() {
            tokio::task::yield_now().await;
        }

        // Arrives mid-pass, after the running pass picked its items
        h.engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(h.engine.run_pass().await, PassResult::default());

        assert_eq!(pass.await.unwrap().synced, 1);
        let mut passes = 0;
        while passes < 2 {
            if let Ok(SyncEvent::SyncComplete { .. }) = events.recv().await {
                passes += 1;
            }
        }
        assert_eq!(h.engine.pending_count().await, 0);
        assert_eq!(h.remote.write_count(), 2);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let h = harness(manual().with_max_retries(1).with_retain_completed(true)).await;
        h.remote.fail_next(1, Fault::Status(422));
        for _ in 0..3 {
            h.engine
                .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(
            h.engine.status_counts().await.get(&ItemStatus::Pending),
            Some(&3)
        );

        h.engine.run_pass().await;
        let counts = h.engine.status_counts().await;
        assert_eq!(counts.get(&ItemStatus::Failed), Some(&1));
        assert_eq!(counts.get(&ItemStatus::Succeeded), Some(&2));
        assert_eq!(counts.get(&ItemStatus::Pending), None);
    }

    #[tokio::test]
    async fn test_retain_completed_until_cleared() {
        let h = harness(manual().with_retain_completed(true)).await;
        let id = h
            .engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        h.engine.run_pass().await;

        let item = h.engine.item(&id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Succeeded);
        assert_eq!(item.entity_id.as_deref(), Some("T1"));
        assert_eq!(h.engine.pending_count().await, 0);

        assert_eq!(h.engine.clear_completed().await, 1);
        assert!(h.engine.all_items().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_discards_everything() {
        let h = harness(manual()).await;
        for _ in 0..3 {
            h.engine
                .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }
        h.engine.clear().await;
        assert!(h.engine.all_items().await.is_empty());
        assert_eq!(h.engine.run_pass().await.synced, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        let h = harness(manual()).await;
        h.store.set_fail_writes(true);

        let id = h
            .engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(h.engine.item(&id).await.is_some());

        let result = h.engine.run_pass().await;
        assert_eq!(result.synced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_lost_stops_between_batches() {
        let h = harness(
            manual()
                .with_batch_size(1)
                .with_inter_batch_delay(Duration::from_millis(100)),
        )
        .await;
        for _ in 0..3 {
            h.engine
                .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let engine = h.engine.clone();
        let network = h.network.clone();
        let mut events = engine.subscribe();
        let pass = tokio::spawn(async move { engine.run_pass().await });

        // Go offline as soon as the first item lands
        loop {
            if let Ok(SyncEvent::ItemSynced { .. }) = events.recv().await {
                network.set_online(false);
                break;
            }
        }

        let result = pass.await.unwrap();
        assert_eq!(result.synced, 1);
        assert_eq!(h.engine.pending_count().await, 2);
    }
}
