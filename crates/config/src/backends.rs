use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    /// Whether the backend is activated at startup.
    pub enabled: bool,

    /// Whether VMs that appear after activation are picked up. Turning this
    /// off keeps collecting for VMs already monitored.
    pub observe_new_jvm: bool,

    /// Sampling period. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub interval: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            observe_new_jvm: true,
            interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Backends {
    /// Per-process I/O counters read from `/proc/<pid>/io`.
    pub io: BackendSettings,

    /// Per-process CPU load derived from `/proc/<pid>/stat`.
    pub cpu: BackendSettings,

    /// Capacity of the queue placed in front of each backend's lifecycle
    /// listener. Zero delivers lifecycle events inline on the discovery
    /// task.
    pub listener_queue: usize,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            io: BackendSettings::default(),
            cpu: BackendSettings::default(),
            listener_queue: 64,
        }
    }
}
