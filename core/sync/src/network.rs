//! Connectivity reporting.

use tokio::sync::watch;
use tracing::info;

/// Reports whether the remote API is reachable and when that changes.
pub trait NetworkMonitor: Send + Sync {
    /// Current connectivity.
    fn is_online(&self) -> bool;

    /// Receiver that observes every connectivity change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Network monitor driven explicitly by the host platform glue.
///
/// Platform code forwards OS reachability callbacks into `set_online`.
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    tx: watch::Sender<bool>,
}

impl ManualNetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report a connectivity state. Repeating the current state is a no-op.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
