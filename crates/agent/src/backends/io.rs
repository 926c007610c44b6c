#![forbid(unsafe_code)]

use crate::backend::{ActionError, BackendInfo, VmPollingAction, VmPollingBackend};
use crate::clock::Clock;
use crate::domain::VmId;
use crate::gateway::{Gateway, GatewayRequest};
use crate::notifier::VmStatusChangeNotifier;
use config::BackendSettings;
use procfs::process::Process;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

pub const NAME: &str = "vm-io";
pub const PATH: &str = "/jvm-io/0.0.1/jvms";

/// Character and syscall counters of one VM at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmIoStat {
    #[serde(rename = "agentId")]
    pub writer_id: String,
    #[serde(rename = "jvmId")]
    pub vm_id: VmId,
    pub time_stamp: u64,
    pub characters_read: u64,
    pub characters_written: u64,
    pub read_syscalls: u64,
    pub write_syscalls: u64,
}

/// Samples `<proc_root>/<pid>/io` and ships it through the gateway.
pub struct IoStatAction {
    writer_id: String,
    proc_root: PathBuf,
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
}

impl IoStatAction {
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

    pub fn sample(&self, vm_id: &VmId, pid: u32) -> Result<VmIoStat, ActionError> {
        let process = Process::new_with_root(self.proc_root.join(pid.to_string()))?;
        let io = process.io()?;
        Ok(VmIoStat {
            writer_id: self.writer_id.clone(),
            vm_id: vm_id.clone(),
            time_stamp: self.clock.epoch_millis(),
            characters_read: io.rchar,
            characters_written: io.wchar,
            read_syscalls: io.syscr,
            write_syscalls: io.syscw,
        })
    }
}

impl VmPollingAction for IoStatAction {
    fn run(&self, vm_id: &VmId, pid: u32) -> Result<(), ActionError> {
        let stat = self.sample(vm_id, pid)?;
        let payload = serde_json::to_value([&stat])?;
        self.gateway
            .send(&GatewayRequest::post(format!("{PATH}/{vm_id}"), payload))?;
        Ok(())
    }
}

/// Polling backend with a single [`IoStatAction`].
pub fn backend(
    notifier: Arc<VmStatusChangeNotifier>,
    settings: &BackendSettings,
    queue_capacity: usize,
    action: IoStatAction,
) -> VmPollingBackend {
    let backend = VmPollingBackend::with_queue(
        BackendInfo::new(NAME, "Gathers I/O statistics about a JVM"),
        notifier,
        settings,
        queue_capacity,
    );
    backend.register_action(Arc::new(action));
    backend
}
