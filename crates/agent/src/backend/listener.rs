#![forbid(unsafe_code)]

use crate::backend::{ActionError, Backend, BackendInfo, EpochListener, Lifecycle};
use crate::domain::{VmId, VmStatus};
use crate::notifier::VmStatusChangeNotifier;
use config::BackendSettings;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// Per-VM collector, told on every tick that fresh counters are available.
pub trait VmUpdateListener: Send {
    fn counters_updated(&mut self) -> Result<(), ActionError>;
}

/// Creates the per-VM listener when a VM becomes visible to the backend.
pub trait VmListenerFactory: Send + Sync {
    fn create(&self, vm_id: &VmId, pid: u32) -> Result<Box<dyn VmUpdateListener>, ActionError>;
}

struct PerVm {
    vm_id: VmId,
    listener: Arc<Mutex<Box<dyn VmUpdateListener>>>,
}

#[derive(Default)]
struct State {
    /// Activation whose lifecycle events are accepted.
    epoch: u64,
    vms: BTreeMap<u32, PerVm>,
}

struct Shared {
    name: String,
    factory: Box<dyn VmListenerFactory>,
    observe_new_jvm: AtomicBool,
    state: Mutex<State>,
}

impl Shared {
    fn is_current(&self, state: &State, epoch: Option<u64>, pid: u32) -> bool {
        let current = epoch.is_none_or(|epoch| epoch == state.epoch);
        if !current {
            trace!(backend = %self.name, pid, "discarding event from a previous activation");
        }
        current
    }
}

impl EpochListener for Shared {
    fn begin_epoch(&self) -> u64 {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.epoch
    }

    fn vm_status_changed_in(&self, epoch: Option<u64>, status: VmStatus, vm_id: &VmId, pid: u32) {
        match status {
            VmStatus::Started | VmStatus::Active => {
                if !self.observe_new_jvm.load(Ordering::Relaxed) {
                    trace!(backend = %self.name, pid, "skipping new vm");
                    return;
                }
                if !self.is_current(&self.state.lock(), epoch, pid) {
                    return;
                }
                // The factory may touch procfs, so it runs outside the lock.
                let created = catch_unwind(AssertUnwindSafe(|| self.factory.create(vm_id, pid)));
                match created {
                    Ok(Ok(listener)) => {
                        let mut state = self.state.lock();
                        if !self.is_current(&state, epoch, pid) {
                            return;
                        }
                        state.vms.insert(
                            pid,
                            PerVm {
                                vm_id: vm_id.clone(),
                                listener: Arc::new(Mutex::new(listener)),
                            },
                        );
                        debug!(backend = %self.name, pid, %vm_id, "vm listener created");
                    }
                    Ok(Err(err)) => {
                        info!(backend = %self.name, pid, %vm_id, %err, "could not create vm listener; ignoring vm");
                    }
                    Err(_) => {
                        warn!(backend = %self.name, pid, %vm_id, "vm listener factory panicked; ignoring vm");
                    }
                }
            }
            VmStatus::Stopped => {
                let mut state = self.state.lock();
                if self.is_current(&state, epoch, pid) && state.vms.remove(&pid).is_some() {
                    debug!(backend = %self.name, pid, %vm_id, "vm listener removed");
                }
            }
        }
    }
}

impl Shared {
    fn update_all(&self) {
        let listeners: Vec<(u32, VmId, Arc<Mutex<Box<dyn VmUpdateListener>>>)> = self
            .state
            .lock()
            .vms
            .iter()
            .map(|(&pid, vm)| (pid, vm.vm_id.clone(), Arc::clone(&vm.listener)))
            .collect();

        for (pid, vm_id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.lock().counters_updated()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(backend = %self.name, pid, %vm_id, %err, "vm update failed"),
                Err(_) => warn!(backend = %self.name, pid, %vm_id, "vm update listener panicked"),
            }
        }
    }
}

/// Event-driven backend: keeps one [`VmUpdateListener`] per monitored VM
/// and notifies each of them once per interval.
pub struct VmListenerBackend {
    info: BackendInfo,
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

impl VmListenerBackend {
    pub fn new(
        info: BackendInfo,
        notifier: Arc<VmStatusChangeNotifier>,
        settings: &BackendSettings,
        factory: Box<dyn VmListenerFactory>,
    ) -> Self {
        Self::with_queue(info, notifier, settings, factory, 0)
    }

    pub fn with_queue(
        info: BackendInfo,
        notifier: Arc<VmStatusChangeNotifier>,
        settings: &BackendSettings,
        factory: Box<dyn VmListenerFactory>,
        queue_capacity: usize,
    ) -> Self {
        let lifecycle = Lifecycle::new(&info.name, notifier, settings.interval, queue_capacity);
        Self {
            shared: Arc::new(Shared {
                name: info.name.clone(),
                factory,
                observe_new_jvm: AtomicBool::new(settings.observe_new_jvm),
                state: Mutex::new(State::default()),
            }),
            info,
            lifecycle,
        }
    }

    pub fn observe_new_jvm(&self) -> bool {
        self.shared.observe_new_jvm.load(Ordering::Relaxed)
    }

    pub fn set_observe_new_jvm(&self, observe: bool) {
        self.shared.observe_new_jvm.store(observe, Ordering::Relaxed);
    }

    pub fn monitored_vms(&self) -> BTreeMap<u32, VmId> {
        self.shared
            .state
            .lock()
            .vms
            .iter()
            .map(|(&pid, vm)| (pid, vm.vm_id.clone()))
            .collect()
    }

    /// Notify every per-VM listener once, on the calling thread.
    pub fn update_all(&self) {
        self.shared.update_all();
    }

    pub fn vm_status_changed(&self, status: VmStatus, vm_id: &VmId, pid: u32) {
        self.shared.vm_status_changed_in(None, status, vm_id, pid);
    }
}

impl Backend for VmListenerBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn activate(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        self.lifecycle.start(&self.shared, move || shared.update_all())
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        updates: Arc<AtomicUsize>,
    }

    impl VmUpdateListener for Counter {
        fn counters_updated(&mut self) -> Result<(), ActionError> {
            self.updates.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Failing;

    impl VmUpdateListener for Failing {
        fn counters_updated(&mut self) -> Result<(), ActionError> {
            Err("counters unavailable".into())
        }
    }

    /// Pid 13 cannot be attached to; pid 66 gets a listener that always fails.
    struct Factory {
        updates: Arc<AtomicUsize>,
    }

    impl VmListenerFactory for Factory {
        fn create(&self, _: &VmId, pid: u32) -> Result<Box<dyn VmUpdateListener>, ActionError> {
            match pid {
                13 => Err("attach refused".into()),
                66 => Ok(Box::new(Failing)),
                _ => Ok(Box::new(Counter {
                    updates: Arc::clone(&self.updates),
                })),
            }
        }
    }

    fn backend(observe: bool) -> (VmListenerBackend, Arc<AtomicUsize>) {
        let updates = Arc::new(AtomicUsize::new(0));
        let settings = BackendSettings {
            observe_new_jvm: observe,
            ..BackendSettings::default()
        };
        let backend = VmListenerBackend::new(
            BackendInfo::new("listener", "test listener backend"),
            Arc::new(VmStatusChangeNotifier::new()),
            &settings,
            Box::new(Factory {
                updates: Arc::clone(&updates),
            }),
        );
        (backend, updates)
    }

    #[test]
    fn listener_per_vm_lifecycle() {
        let (backend, updates) = backend(true);
        backend.vm_status_changed(VmStatus::Started, &VmId::new("a"), 1);
        backend.vm_status_changed(VmStatus::Active, &VmId::new("b"), 2);
        backend.update_all();
        assert_eq!(updates.load(Ordering::Relaxed), 2);

        backend.vm_status_changed(VmStatus::Stopped, &VmId::new("a"), 1);
        backend.update_all();
        assert_eq!(updates.load(Ordering::Relaxed), 3);
        assert_eq!(backend.monitored_vms().keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn factory_failure_skips_vm() {
        let (backend, _) = backend(true);
        backend.vm_status_changed(VmStatus::Started, &VmId::new("x"), 13);
        assert!(backend.monitored_vms().is_empty());
    }

    #[test]
    fn failing_update_does_not_affect_other_vms() {
        let (backend, updates) = backend(true);
        backend.vm_status_changed(VmStatus::Started, &VmId::new("bad"), 66);
        backend.vm_status_changed(VmStatus::Started, &VmId::new("good"), 1);
        backend.update_all();
        backend.update_all();
        assert_eq!(updates.load(Ordering::Relaxed), 2);
        assert_eq!(backend.monitored_vms().len(), 2);
    }

    #[test]
    fn not_observing_skips_new_vms() {
        let (backend, _) = backend(false);
        assert!(!backend.observe_new_jvm());
        backend.vm_status_changed(VmStatus::Started, &VmId::new("a"), 1);
        assert!(backend.monitored_vms().is_empty());
    }

    #[test]
    fn events_from_a_previous_activation_are_discarded() {
        let (backend, _) = backend(true);
        let stale = backend.shared.begin_epoch();
        backend.deactivate();

        backend
            .shared
            .vm_status_changed_in(Some(stale), VmStatus::Started, &VmId::new("late"), 7);
        assert!(backend.monitored_vms().is_empty());
    }

    #[tokio::test]
    async fn deactivate_releases_vms_still_in_the_queue() {
        let notifier = Arc::new(VmStatusChangeNotifier::new());
        let backend = VmListenerBackend::with_queue(
            BackendInfo::new("listener", "queued listener backend"),
            Arc::clone(&notifier),
            &BackendSettings::default(),
            Box::new(Factory {
                updates: Arc::new(AtomicUsize::new(0)),
            }),
            64,
        );
        for round in 0..20u32 {
            assert!(backend.activate());
            for pid in 0..64 {
                let pid = round * 100 + pid + 1_000;
                notifier
                    .notify_vm_status_change(VmStatus::Started, &VmId::new(format!("vm-{pid}")), pid)
                    .unwrap();
            }
            assert!(backend.deactivate());
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            assert!(backend.monitored_vms().is_empty(), "round {round}");
        }
    }
}
