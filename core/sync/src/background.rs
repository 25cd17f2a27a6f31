//! Glue between the engine and an OS background execution facility.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fieldsync_common::{Error, Result};

use crate::engine::{PassResult, SyncEngine};

/// Status reported back to the OS when a background window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundFetchResult {
    /// At least one item was delivered.
    NewData,
    /// Nothing to deliver, or the device was offline.
    NoData,
    /// Every attempt in the window failed.
    Failed,
}

impl From<&PassResult> for BackgroundFetchResult {
    fn from(result: &PassResult) -> Self {
        if result.synced > 0 {
            BackgroundFetchResult::NewData
        } else if result.failed > 0 {
            BackgroundFetchResult::Failed
        } else {
            BackgroundFetchResult::NoData
        }
    }
}

/// Work the host runs each time the OS grants a background window.
pub type BackgroundTask = Arc<dyn Fn() -> BoxFuture<'static, BackgroundFetchResult> + Send + Sync>;

/// OS facility that wakes the app periodically.
#[async_trait]
pub trait BackgroundTaskHost: Send + Sync {
    /// Register `task` to run roughly every `interval`.
    ///
    /// The OS may run it less often than requested.
    async fn register_periodic_task(
        &self,
        name: &str,
        interval: Duration,
        task: BackgroundTask,
    ) -> Result<()>;
}

/// Name the sync task is registered under.
pub const BACKGROUND_SYNC_TASK: &str = "fieldsync.background-sync";

/// Run one pass bounded by the configured background budget.
pub async fn run_background_sync(engine: &SyncEngine) -> BackgroundFetchResult {
    if !engine.is_online() {
        debug!("Background window while offline");
        return BackgroundFetchResult::NoData;
    }
    let budget = engine.config().background_budget;
    let result = engine.run_background_pass(budget).await;
    let outcome = BackgroundFetchResult::from(&result);
    info!(
        "Background sync finished: {:?} ({} synced, {} failed)",
        outcome, result.synced, result.failed
    );
    outcome
}

/// Register the engine's pass with `host`.
pub async fn register_background_sync(
    engine: SyncEngine,
    host: &dyn BackgroundTaskHost,
    interval: Duration,
) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::InvalidInput(
            "Background interval must be positive".to_string(),
        ));
    }

    let task: BackgroundTask = Arc::new(move || -> BoxFuture<'static, BackgroundFetchResult> {
        let engine = engine.clone();
        Box::pin(async move { run_background_sync(&engine).await })
    });

    host.register_periodic_task(BACKGROUND_SYNC_TASK, interval, task)
        .await?;
    info!("Registered background sync every {:?}", interval);
    Ok(())
}

/// Host backed by tokio timers, for desktop builds and tests.
///
/// Registered tasks stop when the host is dropped.
#[derive(Default)]
pub struct TokioTaskHost {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TokioTaskHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of registered tasks.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackgroundTaskHost for TokioTaskHost {
    async fn register_periodic_task(
        &self,
        name: &str,
        interval: Duration,
        task: BackgroundTask,
    ) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Scheduler("Task host lock poisoned".to_string()))?;
        if tasks.iter().any(|(existing, _)| existing == name) {
            return Err(Error::InvalidInput(format!(
                "Background task {} already registered",
                name
            )));
        }

        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let outcome = task().await;
                if outcome == BackgroundFetchResult::Failed {
                    warn!("Background task {} reported failure", task_name);
                }
            }
        });
        tasks.push((name.to_string(), handle));
        Ok(())
    }
}

impl Drop for TokioTaskHost {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for (_, handle) in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}
