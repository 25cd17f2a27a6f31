//! FieldSync sync engine
//!
//! Offline-first delivery of entity mutations, including:
//! - Durable priority queue that survives restarts
//! - Network-aware, batched sync passes
//! - Retry with exponential backoff
//! - Conflict detection with per-entity-type resolution and merges
//! - Lifecycle events and background execution glue

pub mod background;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod http;
pub mod memory;
pub mod merge;
pub mod network;
pub mod queue_store;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod stats;

// Re-export main types
pub use background::{
    register_background_sync, run_background_sync, BackgroundFetchResult, BackgroundTask,
    BackgroundTaskHost, TokioTaskHost,
};
pub use config::SyncConfig;
pub use conflict::{default_policies, ConflictOutcome, ConflictPolicy, ConflictResolver};
pub use engine::{EnqueueOptions, PassResult, SyncEngine};
pub use events::{EventBus, SyncEvent};
pub use http::HttpEntityClient;
pub use memory::{Fault, MemoryEntityClient, RemoteCall};
pub use merge::{FieldRule, FieldRulesMerge, MergeStrategy, ShallowMerge};
pub use network::{ManualNetworkMonitor, NetworkMonitor};
pub use queue_store::{PersistedState, QueueStore};
pub use remote::{RemoteEntity, RemoteEntityClient, TimeoutClient};
pub use retry::BackoffConfig;
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{IdMap, ItemStatus, Operation, Priority, SyncItem, SyncQueue};
pub use stats::SyncStatistics;
