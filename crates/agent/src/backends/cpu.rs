#![forbid(unsafe_code)]

use crate::backend::{
    ActionError, BackendInfo, VmListenerBackend, VmListenerFactory, VmUpdateListener,
};
use crate::clock::Clock;
use crate::domain::VmId;
use crate::gateway::{Gateway, GatewayRequest};
use crate::notifier::VmStatusChangeNotifier;
use config::BackendSettings;
use procfs::process::Process;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NAME: &str = "vm-cpu";
pub const PATH: &str = "/jvm-cpu/0.0.1/jvms";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCpuStat {
    #[serde(rename = "agentId")]
    pub writer_id: String,
    #[serde(rename = "jvmId")]
    pub vm_id: VmId,
    pub time_stamp: u64,
    /// Percent of one CPU used since the previous sample.
    pub cpu_load: f64,
}

/// CPU time consumed between two samples as a percentage of one CPU.
pub fn cpu_load(
    previous_ticks: u64,
    ticks: u64,
    elapsed: Duration,
    ticks_per_second: u64,
) -> Option<f64> {
    if elapsed.is_zero() || ticks_per_second == 0 {
        return None;
    }
    let cpu_seconds = ticks.saturating_sub(previous_ticks) as f64 / ticks_per_second as f64;
    Some(cpu_seconds / elapsed.as_secs_f64() * 100.0)
}

struct CpuListener {
    writer_id: String,
    vm_id: VmId,
    proc_dir: PathBuf,
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
    ticks_per_second: u64,
    previous: Option<(Instant, u64)>,
}

impl VmUpdateListener for CpuListener {
    fn counters_updated(&mut self) -> Result<(), ActionError> {
        let stat = Process::new_with_root(self.proc_dir.clone())?.stat()?;
        let ticks = stat.utime + stat.stime;
        let now = self.clock.now();

        let load = self.previous.and_then(|(at, previous_ticks)| {
            cpu_load(
                previous_ticks,
                ticks,
                now.saturating_duration_since(at),
                self.ticks_per_second,
            )
        });
        self.previous = Some((now, ticks));

        // The first sample only establishes a baseline.
        let Some(cpu_load) = load else {
            return Ok(());
        };
        let stat = VmCpuStat {
            writer_id: self.writer_id.clone(),
            vm_id: self.vm_id.clone(),
            time_stamp: self.clock.epoch_millis(),
            cpu_load,
        };
        let payload = serde_json::to_value([&stat])?;
        self.gateway
            .send(&GatewayRequest::post(format!("{PATH}/{}", self.vm_id), payload))?;
        Ok(())
    }
}

pub struct CpuListenerFactory {
    writer_id: String,
    proc_root: PathBuf,
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
}

impl CpuListenerFactory {
    pub fn new(
        writer_id: impl Into<String>,
        proc_root: impl Into<PathBuf>,
        gateway: Arc<dyn Gateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            writer_id: writer_id.into(),
            proc_root: proc_root.into(),
            gateway,
            clock,
        }
    }
}

impl VmListenerFactory for CpuListenerFactory {
    fn create(&self, vm_id: &VmId, pid: u32) -> Result<Box<dyn VmUpdateListener>, ActionError> {
        let proc_dir = self.proc_root.join(pid.to_string());
        if !proc_dir.is_dir() {
            return Err(format!("no procfs entry for pid {pid}").into());
        }
        Ok(Box::new(CpuListener {
            writer_id: self.writer_id.clone(),
            vm_id: vm_id.clone(),
            proc_dir,
            gateway: Arc::clone(&self.gateway),
            clock: Arc::clone(&self.clock),
            ticks_per_second: procfs::ticks_per_second(),
            previous: None,
        }))
    }
}

pub fn backend(
    notifier: Arc<VmStatusChangeNotifier>,
    settings: &BackendSettings,
    queue_capacity: usize,
    factory: CpuListenerFactory,
) -> VmListenerBackend {
    VmListenerBackend::with_queue(
        BackendInfo::new(NAME, "Gathers CPU usage of a JVM"),
        notifier,
        settings,
        Box::new(factory),
        queue_capacity,
    )
}
