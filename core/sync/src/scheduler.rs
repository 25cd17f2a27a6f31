//! Sync scheduling: on-demand requests, connectivity restores and periodic passes.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use fieldsync_common::{Error, Result};

use crate::engine::{PassResult, SyncEngine};

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a pass now.
    Pass,
    /// Shutdown the scheduler.
    Shutdown,
}

type Envelope = (SyncRequest, oneshot::Sender<Result<PassResult>>);

/// Sender side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a scheduler for `engine`.
    ///
    /// The returned handle must be run (usually spawned) for requests to be
    /// served.
    pub fn new(engine: SyncEngine) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let handle = SyncSchedulerHandle { engine, request_rx };
        (Self { request_tx }, handle)
    }

    /// Request a pass and wait for its result.
    ///
    /// A pass that was skipped (offline or already running) reports zero
    /// counts.
    pub async fn request_sync(&self) -> Result<PassResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Pass, response_tx))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    engine: SyncEngine,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown or until every sender is gone.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self) {
        let config = self.engine.config().clone();
        let mut connectivity = self.engine.network().subscribe();
        let mut was_online = *connectivity.borrow_and_update();
        let mut watching = true;
        let mut periodic = config.periodic_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        info!(
            "Sync scheduler started (periodic: {:?}, debounce: {:?})",
            config.periodic_interval, config.connectivity_debounce
        );

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Pass, response_tx)) => {
                            debug!("Processing sync request");
                            let result = self.engine.run_pass().await;
                            let _ = response_tx.send(Ok(result));
                        }
                        Some((SyncRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        None => {
                            debug!("All scheduler senders dropped");
                            break;
                        }
                    }
                }

                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Network monitor closed, connectivity triggers disabled");
                        watching = false;
                        continue;
                    }
                    let online = *connectivity.borrow_and_update();
                    if online && !was_online {
                        was_online = true;
                        self.on_reconnect(&mut connectivity, config.connectivity_debounce)
                            .await;
                        was_online = *connectivity.borrow();
                    } else {
                        was_online = online;
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    let pending = self.engine.pending_count().await;
                    if pending > 0 {
                        debug!("Triggering periodic sync for {} pending items", pending);
                        self.engine.run_pass().await;
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Wait out the debounce window and run a pass if still online.
    async fn on_reconnect(&self, connectivity: &mut watch::Receiver<bool>, debounce: Duration) {
        tokio::time::sleep(debounce).await;
        if !*connectivity.borrow_and_update() || !self.engine.is_online() {
            debug!("Connectivity flapped during debounce, skipping pass");
            return;
        }
        info!("Connectivity restored, starting sync pass");
        self.engine.run_pass().await;
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::conflict::ConflictResolver;
    use crate::engine::EnqueueOptions;
    use crate::memory::MemoryEntityClient;
    use crate::network::ManualNetworkMonitor;
    use crate::state::Operation;
    use fieldsync_storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn engine(
        config: SyncConfig,
        online: bool,
    ) -> (SyncEngine, Arc<MemoryEntityClient>, Arc<ManualNetworkMonitor>) {
        let remote = Arc::new(MemoryEntityClient::new());
        let network = Arc::new(ManualNetworkMonitor::new(online));
        let engine = SyncEngine::open(
            remote.clone(),
            Arc::new(MemoryStore::new()),
            network.clone(),
            ConflictResolver::standard(),
            config.with_sync_on_enqueue(false),
        )
        .await
        .unwrap();
        (engine, remote, network)
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (engine, remote, _network) = engine(SyncConfig::default(), true).await;
        engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let (scheduler, handle) = SyncScheduler::new(engine);
        let task = tokio::spawn(handle.run());

        let result = scheduler.request_sync().await.unwrap();
        assert_eq!(result.synced, 1);
        assert_eq!(remote.write_count(), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(matches!(
            scheduler.request_sync().await,
            Err(Error::Scheduler(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_debounced() {
        let config = SyncConfig::default()
            .with_periodic_interval(None)
            .with_connectivity_debounce(Duration::from_millis(500));
        let (engine, remote, network) = engine(config, false).await;
        engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let (scheduler, handle) = SyncScheduler::new(engine.clone());
        let task = tokio::spawn(handle.run());
        tokio::task::yield_now().await;

        network.set_online(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(remote.write_count(), 1);
        assert_eq!(engine.pending_count().await, 0);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_connection_skips_pass() {
        let config = SyncConfig::default()
            .with_periodic_interval(None)
            .with_connectivity_debounce(Duration::from_millis(500));
        let (engine, remote, network) = engine(config, false).await;
        engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let (scheduler, handle) = SyncScheduler::new(engine.clone());
        let task = tokio::spawn(handle.run());
        tokio::task::yield_now().await;

        network.set_online(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.set_online(false);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(remote.write_count(), 0);
        assert_eq!(engine.pending_count().await, 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_pass_only_with_pending_items() {
        let config = SyncConfig::default().with_periodic_interval(Some(Duration::from_secs(30)));
        let (engine, remote, _network) = engine(config, true).await;

        let (scheduler, handle) = SyncScheduler::new(engine.clone());
        let task = tokio::spawn(handle.run());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(engine.statistics().await.pass_count, 0);

        engine
            .enqueue(Operation::Create, "tasks", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(remote.write_count(), 1);
        assert_eq!(engine.statistics().await.pass_count, 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }
}
