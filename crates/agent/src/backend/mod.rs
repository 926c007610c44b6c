#![forbid(unsafe_code)]

mod listener;
mod monitor;
mod polling;

pub use listener::{VmListenerBackend, VmListenerFactory, VmUpdateListener};
pub use monitor::{RegistryConnector, VmMonitorBackend};
pub use polling::{EXCEPTION_THRESHOLD, VmPollingAction, VmPollingBackend};

use crate::dispatch::QueuedListener;
use crate::domain::{ListenerId, VmId, VmStatus};
use crate::notifier::{VmStatusChangeNotifier, VmStatusListener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type returned by pluggable per-VM work.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    pub description: String,
    pub vendor: String,
    pub version: String,
}

impl BackendInfo {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            vendor: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A data-collection unit attached to the VM lifecycle.
pub trait Backend: Send + Sync {
    fn info(&self) -> &BackendInfo;
    /// Returns whether the backend is active afterwards.
    fn activate(&self) -> bool;
    /// Returns whether the backend is inactive afterwards.
    fn deactivate(&self) -> bool;
    fn is_active(&self) -> bool;
}

/// Backend state that only accepts lifecycle events from its current
/// activation. The epoch check and the state change happen under the same
/// lock as the clear on deactivation.
pub(crate) trait EpochListener: Send + Sync {
    /// Start a new activation and return its epoch.
    fn begin_epoch(&self) -> u64;
    fn vm_status_changed_in(&self, epoch: Option<u64>, status: VmStatus, vm_id: &VmId, pid: u32);
}

/// The listener a backend registers for one activation.
struct Registration<S> {
    shared: Arc<S>,
    epoch: u64,
}

impl<S: EpochListener> VmStatusListener for Registration<S> {
    fn vm_status_changed(&self, status: VmStatus, vm_id: &VmId, pid: u32) {
        self.shared
            .vm_status_changed_in(Some(self.epoch), status, vm_id, pid);
    }
}

struct Running {
    listener: ListenerId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Notifier registration plus a periodic tick, shared by the polling and
/// listener backends.
pub(crate) struct Lifecycle {
    name: String,
    notifier: Arc<VmStatusChangeNotifier>,
    interval: Duration,
    queue_capacity: usize,
    running: Mutex<Option<Running>>,
}

impl Lifecycle {
    pub(crate) fn new(
        name: &str,
        notifier: Arc<VmStatusChangeNotifier>,
        interval: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            notifier,
            interval,
            queue_capacity,
            running: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Open a new epoch on `shared`, register it with the notifier and start
    /// calling `tick` every interval on the blocking pool. Must be called
    /// inside a tokio runtime.
    pub(crate) fn start<S, F>(&self, shared: &Arc<S>, tick: F) -> bool
    where
        S: EpochListener + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return true;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(backend = %self.name, "cannot activate outside of a tokio runtime");
            return false;
        };

        let listener: Arc<dyn VmStatusListener> = Arc::new(Registration {
            epoch: shared.begin_epoch(),
            shared: Arc::clone(shared),
        });
        let listener = if self.queue_capacity > 0 {
            match QueuedListener::spawn(&self.name, listener, self.queue_capacity) {
                Ok(queued) => Arc::new(queued) as Arc<dyn VmStatusListener>,
                Err(err) => {
                    warn!(backend = %self.name, %err, "failed to start listener queue");
                    return false;
                }
            }
        } else {
            listener
        };
        let listener = self.notifier.register(listener);

        let cancel = CancellationToken::new();
        let task = handle.spawn(tick_loop(
            self.name.clone(),
            self.interval,
            cancel.clone(),
            Arc::new(tick),
        ));
        *running = Some(Running {
            listener,
            cancel,
            task,
        });
        info!(backend = %self.name, interval = ?self.interval, "backend activated");
        true
    }

    /// Stop future ticks and event delivery. A tick already in progress is
    /// allowed to finish. Queued events may still reach the backend, which
    /// discards them once it has moved past this activation's epoch.
    pub(crate) fn stop(&self) -> bool {
        let Some(running) = self.running.lock().take() else {
            return false;
        };
        running.cancel.cancel();
        self.notifier.unregister(running.listener);
        drop(running.task);
        info!(backend = %self.name, "backend deactivated");
        true
    }
}

async fn tick_loop(
    name: String,
    interval: Duration,
    cancel: CancellationToken,
    tick: Arc<dyn Fn() + Send + Sync>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let tick = Arc::clone(&tick);
                if let Err(err) = tokio::task::spawn_blocking(move || tick()).await {
                    warn!(backend = %name, %err, "scheduled tick failed");
                }
            }
        }
    }
    debug!(backend = %name, "tick loop finished");
}
