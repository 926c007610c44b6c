#![forbid(unsafe_code)]

use crate::domain::{ListenerId, VmId, VmStatus};
use crate::error::Error;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Receives VM lifecycle transitions.
///
/// Callbacks run while the notifier holds its lock, so implementations must
/// return promptly and must not call back into the notifier. Wrap slow
/// listeners in [`crate::dispatch::QueuedListener`].
pub trait VmStatusListener: Send + Sync {
    fn vm_status_changed(&self, status: VmStatus, vm_id: &VmId, pid: u32);
}

struct Registration {
    listener: Arc<dyn VmStatusListener>,
    notified: BTreeSet<u32>,
}

#[derive(Default)]
struct State {
    active: BTreeMap<u32, VmId>,
    listeners: SlotMap<ListenerId, Registration>,
}

/// Owns the table of active VMs and fans lifecycle events out to listeners.
///
/// Table mutation, listener registration and delivery are serialised by one
/// lock: a listener registering concurrently with a start sees that VM
/// either through its catch-up `Active` event or through the `Started`
/// event, never both.
#[derive(Default)]
pub struct VmStatusChangeNotifier {
    state: Mutex<State>,
}

impl VmStatusChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a start or stop. `Active` is reserved for catch-up delivery
    /// and is rejected without touching any state.
    pub fn notify_vm_status_change(
        &self,
        status: VmStatus,
        vm_id: &VmId,
        pid: u32,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        match status {
            VmStatus::Active => return Err(Error::InvalidStatus(status)),
            VmStatus::Started => {
                if let Some(previous) = state.active.insert(pid, vm_id.clone()) {
                    warn!(pid, %previous, %vm_id, "pid restarted without a stop; replacing");
                }
                for registration in state.listeners.values_mut() {
                    deliver(&*registration.listener, status, vm_id, pid);
                    registration.notified.insert(pid);
                }
            }
            VmStatus::Stopped => {
                for registration in state.listeners.values_mut() {
                    deliver(&*registration.listener, status, vm_id, pid);
                    registration.notified.remove(&pid);
                }
                if state.active.remove(&pid).is_none() {
                    debug!(pid, %vm_id, "stop for a pid that was not active");
                }
            }
        }
        trace!(%status, pid, %vm_id, listeners = state.listeners.len(), "vm status delivered");
        Ok(())
    }

    /// Register a listener. Before this returns the listener has received
    /// one `Active` event for every VM in the active table.
    pub fn register(&self, listener: Arc<dyn VmStatusListener>) -> ListenerId {
        let mut state = self.state.lock();
        let mut notified = BTreeSet::new();
        for (&pid, vm_id) in &state.active {
            deliver(&*listener, VmStatus::Active, vm_id, pid);
            notified.insert(pid);
        }
        let caught_up = notified.len();
        let id = state.listeners.insert(Registration { listener, notified });
        debug!(?id, caught_up, "listener registered");
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = self.state.lock().listeners.remove(id).is_some();
        if removed {
            debug!(?id, "listener unregistered");
        }
        removed
    }

    pub fn active_vms(&self) -> BTreeMap<u32, VmId> {
        self.state.lock().active.clone()
    }

    pub fn vm_id_for_pid(&self, pid: u32) -> Option<VmId> {
        self.state.lock().active.get(&pid).cloned()
    }

    pub fn pid_for_vm_id(&self, vm_id: &str) -> Option<u32> {
        self.state
            .lock()
            .active
            .iter()
            .find(|(_, id)| id.as_str() == vm_id)
            .map(|(&pid, _)| pid)
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Pids the listener currently knows as running, or `None` if `id` is
    /// not registered.
    pub fn notified_pids(&self, id: ListenerId) -> Option<BTreeSet<u32>> {
        self.state
            .lock()
            .listeners
            .get(id)
            .map(|registration| registration.notified.clone())
    }
}

fn deliver(listener: &dyn VmStatusListener, status: VmStatus, vm_id: &VmId, pid: u32) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        listener.vm_status_changed(status, vm_id, pid)
    }));
    if outcome.is_err() {
        warn!(%status, pid, %vm_id, "vm status listener panicked");
    }
}
