#![forbid(unsafe_code)]

use crate::clock::{Clock, SystemClock};
use crate::discovery::{MetadataExtractor, ProcessRegistry, RegistryDelta, VmBlacklist};
use crate::domain::{IdAllocator, UuidAllocator, VmId, VmInfo, VmMetadata, VmStatus};
use crate::error::Error;
use crate::notifier::VmStatusChangeNotifier;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Perf data is written by the VM shortly after start, so a failed
/// extraction is retried on later polls before the pid is given up.
const MAX_EXTRACT_ATTEMPTS: u32 = 3;

/// Persists the lifecycle records of monitored VMs.
pub trait VmInfoSink: Send + Sync {
    fn vm_started(&self, info: &VmInfo);
    fn vm_stopped(&self, vm_id: &VmId, pid: u32, stop_time: u64);
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub started: Vec<(u32, VmId)>,
    pub stopped: Vec<(u32, VmId)>,
    pub ignored: Vec<u32>,
    pub failed: Vec<u32>,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.ignored.is_empty()
            && self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct MonitoredVm {
    vm_id: VmId,
    main_class: String,
}

/// Turns registry deltas into lifecycle events.
///
/// Each pid is `unseen`, `active` (in `monitored`) or ignored because it is
/// blacklisted. Terminations are handled before starts so that a reused pid
/// never inherits the previous owner's id.
pub struct HostListener {
    writer_id: String,
    notifier: Arc<VmStatusChangeNotifier>,
    blacklist: Arc<VmBlacklist>,
    extractor: Box<dyn MetadataExtractor>,
    ids: Box<dyn IdAllocator>,
    sink: Option<Arc<dyn VmInfoSink>>,
    clock: Arc<dyn Clock>,
    monitored: BTreeMap<u32, MonitoredVm>,
    ignored: BTreeSet<u32>,
    retry: BTreeMap<u32, u32>,
}

impl HostListener {
    pub fn new(
        writer_id: impl Into<String>,
        notifier: Arc<VmStatusChangeNotifier>,
        blacklist: Arc<VmBlacklist>,
        extractor: Box<dyn MetadataExtractor>,
    ) -> Self {
        Self {
            writer_id: writer_id.into(),
            notifier,
            blacklist,
            extractor,
            ids: Box::new(UuidAllocator),
            sink: None,
            clock: Arc::new(SystemClock),
            monitored: BTreeMap::new(),
            ignored: BTreeSet::new(),
            retry: BTreeMap::new(),
        }
    }

    pub fn with_ids(mut self, ids: Box<dyn IdAllocator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn VmInfoSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn monitored(&self) -> BTreeMap<u32, VmId> {
        self.monitored
            .iter()
            .map(|(&pid, vm)| (pid, vm.vm_id.clone()))
            .collect()
    }

    pub fn ignored(&self) -> &BTreeSet<u32> {
        &self.ignored
    }

    pub fn poll_once(&mut self, registry: &mut dyn ProcessRegistry) -> Result<PollReport, Error> {
        let delta = registry.poll()?;
        Ok(self.handle_delta(&delta))
    }

    pub fn handle_delta(&mut self, delta: &RegistryDelta) -> PollReport {
        let mut report = PollReport::default();

        for &pid in &delta.terminated {
            self.retry.remove(&pid);
            if self.ignored.remove(&pid) {
                trace!(pid, "ignored vm terminated");
                continue;
            }
            match self.monitored.remove(&pid) {
                Some(vm) => self.retire(pid, vm, &mut report),
                None => trace!(pid, "untracked pid terminated"),
            }
        }

        let mut candidates: BTreeSet<u32> = self.retry.keys().copied().collect();
        candidates.extend(delta.started.iter().copied());
        for pid in candidates {
            self.admit(pid, delta.started.contains(&pid), &mut report);
        }

        report
    }

    /// Poll `registry` every `interval` until `cancel` fires. Errors from a
    /// single poll are logged and polling continues.
    pub async fn run_until(
        &mut self,
        registry: &mut dyn ProcessRegistry,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            let poll_start = self.clock.now();
            match self.poll_once(registry) {
                Ok(report) if !report.is_empty() => debug!(?report, "poll cycle"),
                Ok(_) => {}
                Err(err) => warn!(%err, "registry poll failed"),
            }

            let elapsed = self.clock.now().saturating_duration_since(poll_start);
            let sleep_for = interval.saturating_sub(elapsed);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(sleep_for) => {}
            }
        }
        info!(monitored = self.monitored.len(), "host listener stopped");
    }

    fn admit(&mut self, pid: u32, fresh: bool, report: &mut PollReport) {
        if fresh {
            if let Some(stale) = self.monitored.remove(&pid) {
                warn!(pid, vm_id = %stale.vm_id, "pid reported started while still active; retiring old id");
                self.retire(pid, stale, report);
            }
            self.ignored.remove(&pid);
            self.retry.remove(&pid);
        }

        let metadata = match self.extract(pid) {
            Ok(metadata) => metadata,
            Err(reason) => {
                let attempts = self.retry.entry(pid).or_insert(0);
                *attempts += 1;
                if *attempts >= MAX_EXTRACT_ATTEMPTS {
                    self.retry.remove(&pid);
                    error!(pid, %reason, "giving up on vm after repeated metadata failures");
                } else {
                    warn!(pid, %reason, "metadata extraction failed; retrying next poll");
                }
                report.failed.push(pid);
                return;
            }
        };
        self.retry.remove(&pid);

        if self.blacklist.is_blacklisted(&metadata.main_class) {
            debug!(pid, main_class = %metadata.main_class, "vm is blacklisted");
            self.ignored.insert(pid);
            report.ignored.push(pid);
            return;
        }

        let vm_id = self.ids.allocate();
        let mut info = VmInfo::new(self.writer_id.clone(), vm_id.clone(), pid, metadata);
        if info.start_time == 0 {
            info.start_time = self.clock.epoch_millis();
        }

        if let Some(sink) = &self.sink {
            guarded("vm_started", pid, || sink.vm_started(&info));
        }
        if let Err(err) = self
            .notifier
            .notify_vm_status_change(VmStatus::Started, &vm_id, pid)
        {
            error!(pid, %vm_id, %err, "failed to publish vm start");
        }
        info!(pid, %vm_id, main_class = %info.main_class, "vm started");
        self.monitored.insert(
            pid,
            MonitoredVm {
                vm_id: vm_id.clone(),
                main_class: info.main_class,
            },
        );
        report.started.push((pid, vm_id));
    }

    fn retire(&mut self, pid: u32, vm: MonitoredVm, report: &mut PollReport) {
        if let Err(err) = self
            .notifier
            .notify_vm_status_change(VmStatus::Stopped, &vm.vm_id, pid)
        {
            error!(pid, vm_id = %vm.vm_id, %err, "failed to publish vm stop");
        }
        if let Some(sink) = &self.sink {
            let stop_time = self.clock.epoch_millis();
            guarded("vm_stopped", pid, || sink.vm_stopped(&vm.vm_id, pid, stop_time));
        }
        info!(pid, vm_id = %vm.vm_id, main_class = %vm.main_class, "vm stopped");
        report.stopped.push((pid, vm.vm_id));
    }

    fn extract(&self, pid: u32) -> Result<VmMetadata, String> {
        match catch_unwind(AssertUnwindSafe(|| self.extractor.extract(pid))) {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("extractor panicked".to_string()),
        }
    }
}

fn guarded(what: &str, pid: u32, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(pid, call = what, "vm info sink panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MainClassFilter;
    use crate::notifier::testing::Recorder;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Main classes per pid; pids missing from the map fail extraction.
    #[derive(Default, Clone)]
    struct FakeExtractor {
        classes: Arc<Mutex<HashMap<u32, String>>>,
        panics_for: Option<u32>,
    }

    impl FakeExtractor {
        fn with(self, pid: u32, main_class: &str) -> Self {
            self.classes.lock().insert(pid, main_class.to_string());
            self
        }
    }

    impl MetadataExtractor for FakeExtractor {
        fn extract(&self, pid: u32) -> Result<VmMetadata, Error> {
            if self.panics_for == Some(pid) {
                panic!("extractor bug");
            }
            let main_class = self
                .classes
                .lock()
                .get(&pid)
                .cloned()
                .ok_or(Error::PerfDataMissing(pid))?;
            Ok(VmMetadata {
                main_class,
                ..VmMetadata::default()
            })
        }
    }

    #[derive(Default)]
    struct Sequential(AtomicU32);

    impl IdAllocator for Sequential {
        fn allocate(&self) -> VmId {
            VmId::from(format!("id-{}", self.0.fetch_add(1, Ordering::Relaxed)))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        started: Mutex<Vec<VmInfo>>,
        stopped: Mutex<Vec<(VmId, u32)>>,
    }

    impl VmInfoSink for RecordingSink {
        fn vm_started(&self, info: &VmInfo) {
            self.started.lock().push(info.clone());
        }

        fn vm_stopped(&self, vm_id: &VmId, pid: u32, _: u64) {
            self.stopped.lock().push((vm_id.clone(), pid));
        }
    }

    struct Fixture {
        notifier: Arc<VmStatusChangeNotifier>,
        blacklist: Arc<VmBlacklist>,
        recorder: Arc<Recorder>,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let notifier = Arc::new(VmStatusChangeNotifier::new());
            let recorder = Arc::new(Recorder::default());
            notifier.register(recorder.clone());
            Self {
                notifier,
                blacklist: Arc::new(VmBlacklist::new()),
                recorder,
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn listener(&self, extractor: FakeExtractor) -> HostListener {
            HostListener::new(
                "writer",
                Arc::clone(&self.notifier),
                Arc::clone(&self.blacklist),
                Box::new(extractor),
            )
            .with_ids(Box::new(Sequential::default()))
            .with_sink(self.sink.clone())
        }
    }

    fn delta(started: &[u32], terminated: &[u32]) -> RegistryDelta {
        RegistryDelta {
            started: started.iter().copied().collect(),
            terminated: terminated.iter().copied().collect(),
        }
    }

    #[test]
    fn started_and_terminated_vms_are_published() {
        let fx = Fixture::new();
        let extractor = FakeExtractor::default().with(1, "a.Main").with(2, "b.Main");
        let mut listener = fx.listener(extractor);

        let report = listener.handle_delta(&delta(&[1, 2], &[]));
        assert_eq!(report.started.len(), 2);
        assert_eq!(fx.notifier.active_vms().len(), 2);
        assert_eq!(fx.sink.started.lock().len(), 2);
        assert_eq!(fx.sink.started.lock()[0].writer_id, "writer");

        let report = listener.handle_delta(&delta(&[], &[1]));
        assert_eq!(report.stopped, vec![(1, VmId::new("id-0"))]);
        assert_eq!(fx.notifier.active_vms().len(), 1);
        assert_eq!(fx.recorder.count(VmStatus::Stopped), 1);
        assert_eq!(*fx.sink.stopped.lock(), vec![(VmId::new("id-0"), 1)]);
    }

    #[test]
    fn blacklisted_vm_is_not_monitored() {
        let fx = Fixture::new();
        fx.blacklist
            .add_filter(Arc::new(MainClassFilter::parse("org.gradle.*").unwrap()));
        let extractor = FakeExtractor::default()
            .with(1, "org.gradle.launcher.GradleMain")
            .with(2, "com.example.Main");
        let mut listener = fx.listener(extractor);

        let report = listener.handle_delta(&delta(&[1, 2], &[]));
        assert_eq!(report.ignored, vec![1]);
        assert_eq!(fx.notifier.vm_id_for_pid(1), None);
        assert_eq!(fx.recorder.count(VmStatus::Started), 1);

        // Termination of an ignored vm produces no event either.
        listener.handle_delta(&delta(&[], &[1]));
        assert_eq!(fx.recorder.count(VmStatus::Stopped), 0);
        assert!(listener.ignored().is_empty());
    }

    #[test]
    fn reused_pid_gets_a_new_id() {
        let fx = Fixture::new();
        let mut listener = fx.listener(FakeExtractor::default().with(7, "a.Main"));

        listener.handle_delta(&delta(&[7], &[]));
        let first = fx.notifier.vm_id_for_pid(7).unwrap();
        listener.handle_delta(&delta(&[7], &[7]));
        let second = fx.notifier.vm_id_for_pid(7).unwrap();

        assert_ne!(first, second);
        let statuses: Vec<VmStatus> = fx.recorder.events().iter().map(|e| e.0).collect();
        assert_eq!(
            statuses,
            vec![VmStatus::Started, VmStatus::Stopped, VmStatus::Started]
        );
    }

    #[test]
    fn restart_without_termination_retires_stale_id() {
        let fx = Fixture::new();
        let mut listener = fx.listener(FakeExtractor::default().with(7, "a.Main"));

        listener.handle_delta(&delta(&[7], &[]));
        let report = listener.handle_delta(&delta(&[7], &[]));
        assert_eq!(report.stopped, vec![(7, VmId::new("id-0"))]);
        assert_eq!(report.started, vec![(7, VmId::new("id-1"))]);
        assert_eq!(fx.notifier.vm_id_for_pid(7), Some(VmId::new("id-1")));
    }

    #[test]
    fn extraction_failures_are_isolated_and_retried() {
        let fx = Fixture::new();
        let extractor = FakeExtractor {
            panics_for: Some(3),
            ..FakeExtractor::default()
        }
        .with(1, "a.Main");
        let mut listener = fx.listener(extractor.clone());

        let report = listener.handle_delta(&delta(&[1, 2, 3], &[]));
        assert_eq!(report.started.len(), 1);
        assert_eq!(report.failed, vec![2, 3]);

        // Perf data for pid 2 shows up before the next poll.
        extractor.classes.lock().insert(2, "b.Main".into());
        let report = listener.handle_delta(&RegistryDelta::default());
        assert_eq!(report.started, vec![(2, VmId::new("id-1"))]);
        assert_eq!(report.failed, vec![3]);

        let report = listener.handle_delta(&RegistryDelta::default());
        assert_eq!(report.failed, vec![3]);
        assert!(listener.handle_delta(&RegistryDelta::default()).is_empty());
    }

    #[test]
    fn missing_start_time_uses_clock() {
        let fx = Fixture::new();
        let mut listener = fx.listener(FakeExtractor::default().with(1, "a.Main"));
        listener.handle_delta(&delta(&[1], &[]));
        assert!(fx.sink.started.lock()[0].start_time > 0);
    }

    struct ScriptedRegistry(Vec<RegistryDelta>);

    impl ProcessRegistry for ScriptedRegistry {
        fn poll(&mut self) -> Result<RegistryDelta, Error> {
            if self.0.is_empty() {
                return Ok(RegistryDelta::default());
            }
            Ok(self.0.remove(0))
        }
    }

    #[tokio::test]
    async fn run_until_polls_until_cancelled() {
        let fx = Fixture::new();
        let mut listener = fx.listener(FakeExtractor::default().with(1, "a.Main"));
        let mut registry = ScriptedRegistry(vec![delta(&[1], &[])]);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let notifier = Arc::clone(&fx.notifier);
        tokio::spawn(async move {
            while notifier.vm_id_for_pid(1).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        listener
            .run_until(&mut registry, Duration::from_millis(10), cancel)
            .await;
        assert_eq!(listener.monitored().len(), 1);
    }
}
