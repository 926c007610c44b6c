#![forbid(unsafe_code)]

use crate::backend::{ActionError, Backend, BackendInfo, EpochListener, Lifecycle};
use crate::domain::{ActionId, VmId, VmStatus};
use crate::notifier::VmStatusChangeNotifier;
use config::BackendSettings;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, error, trace, warn};

/// Failed invocations, summed over all VMs, after which an action is
/// unregistered.
pub const EXCEPTION_THRESHOLD: u32 = 10;

/// Work run once per scheduling tick for every monitored VM.
pub trait VmPollingAction: Send + Sync {
    fn run(&self, vm_id: &VmId, pid: u32) -> Result<(), ActionError>;
}

struct ActionEntry {
    action: Arc<dyn VmPollingAction>,
    failures: AtomicU32,
    disabled: AtomicBool,
}

#[derive(Default)]
struct State {
    /// Activation whose lifecycle events are accepted.
    epoch: u64,
    vms: BTreeMap<u32, VmId>,
    actions: SlotMap<ActionId, Arc<ActionEntry>>,
}

struct Shared {
    name: String,
    observe_new_jvm: AtomicBool,
    state: Mutex<State>,
}

impl EpochListener for Shared {
    fn begin_epoch(&self) -> u64 {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.epoch
    }

    fn vm_status_changed_in(&self, epoch: Option<u64>, status: VmStatus, vm_id: &VmId, pid: u32) {
        let mut state = self.state.lock();
        if epoch.is_some_and(|epoch| epoch != state.epoch) {
            trace!(backend = %self.name, pid, %status, "discarding event from a previous activation");
            return;
        }
        match status {
            VmStatus::Started | VmStatus::Active => {
                if self.observe_new_jvm.load(Ordering::Relaxed) {
                    state.vms.insert(pid, vm_id.clone());
                    debug!(backend = %self.name, pid, %vm_id, %status, "monitoring vm");
                } else {
                    trace!(backend = %self.name, pid, "skipping new vm");
                }
            }
            VmStatus::Stopped => {
                state.vms.remove(&pid);
            }
        }
    }
}

impl Shared {
    fn do_scheduled_actions(&self) {
        let (vms, actions): (Vec<(u32, VmId)>, Vec<(ActionId, Arc<ActionEntry>)>) = {
            let state = self.state.lock();
            (
                state.vms.iter().map(|(&pid, id)| (pid, id.clone())).collect(),
                state
                    .actions
                    .iter()
                    .map(|(id, entry)| (id, Arc::clone(entry)))
                    .collect(),
            )
        };

        for (pid, vm_id) in &vms {
            for (action_id, entry) in &actions {
                if entry.disabled.load(Ordering::Acquire) {
                    continue;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| entry.action.run(vm_id, *pid)));
                let reason = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => "action panicked".to_string(),
                };
                let failures = entry.failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(backend = %self.name, pid, %vm_id, failures, %reason, "polling action failed");
                if failures >= EXCEPTION_THRESHOLD && !entry.disabled.swap(true, Ordering::AcqRel) {
                    self.state.lock().actions.remove(*action_id);
                    error!(
                        backend = %self.name,
                        ?action_id,
                        failures,
                        "polling action failed too often; unregistered for all vms"
                    );
                }
            }
        }
    }
}

/// Runs registered actions against every monitored VM once per interval.
pub struct VmPollingBackend {
    info: BackendInfo,
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

impl VmPollingBackend {
    pub fn new(
        info: BackendInfo,
        notifier: Arc<VmStatusChangeNotifier>,
        settings: &BackendSettings,
    ) -> Self {
        Self::with_queue(info, notifier, settings, 0)
    }

    /// Like [`VmPollingBackend::new`], with lifecycle events queued for a
    /// worker thread when `queue_capacity` is non-zero.
    pub fn with_queue(
        info: BackendInfo,
        notifier: Arc<VmStatusChangeNotifier>,
        settings: &BackendSettings,
        queue_capacity: usize,
    ) -> Self {
        let lifecycle = Lifecycle::new(&info.name, notifier, settings.interval, queue_capacity);
        Self {
            shared: Arc::new(Shared {
                name: info.name.clone(),
                observe_new_jvm: AtomicBool::new(settings.observe_new_jvm),
                state: Mutex::new(State::default()),
            }),
            info,
            lifecycle,
        }
    }

    pub fn register_action(&self, action: Arc<dyn VmPollingAction>) -> ActionId {
        self.shared.state.lock().actions.insert(Arc::new(ActionEntry {
            action,
            failures: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        }))
    }

    /// Returns false if the action is unknown or was already disabled.
    pub fn unregister_action(&self, id: ActionId) -> bool {
        self.shared.state.lock().actions.remove(id).is_some()
    }

    pub fn action_count(&self) -> usize {
        self.shared.state.lock().actions.len()
    }

    pub fn observe_new_jvm(&self) -> bool {
        self.shared.observe_new_jvm.load(Ordering::Relaxed)
    }

    /// Takes effect for VMs reported after the change.
    pub fn set_observe_new_jvm(&self, observe: bool) {
        self.shared.observe_new_jvm.store(observe, Ordering::Relaxed);
    }

    pub fn monitored_vms(&self) -> BTreeMap<u32, VmId> {
        self.shared.state.lock().vms.clone()
    }

    /// Run one scheduling tick on the calling thread.
    pub fn do_scheduled_actions(&self) {
        self.shared.do_scheduled_actions();
    }

    /// Deliver a lifecycle event directly, bypassing the notifier.
    pub fn vm_status_changed(&self, status: VmStatus, vm_id: &VmId, pid: u32) {
        self.shared.vm_status_changed_in(None, status, vm_id, pid);
    }
}

impl Backend for VmPollingBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn activate(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        self.lifecycle
            .start(&self.shared, move || shared.do_scheduled_actions())
    }

    fn deactivate(&self) -> bool {
        self.lifecycle.stop();
        let mut state = self.shared.state.lock();
        state.epoch += 1;
        state.vms.clear();
        true
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_running()
    }
}
