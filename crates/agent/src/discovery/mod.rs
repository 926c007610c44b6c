#![forbid(unsafe_code)]

mod blacklist;
mod host_listener;
mod hsperf;
pub mod perfdata;

pub use blacklist::{MainClassFilter, VmBlacklist, VmFilter};
pub use host_listener::{HostListener, PollReport, VmInfoSink};
pub use hsperf::{HsperfRegistry, PerfDataExtractor};

use crate::domain::VmMetadata;
use crate::error::Error;
use std::collections::BTreeSet;

/// Pids that appeared and disappeared since the previous poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDelta {
    pub started: BTreeSet<u32>,
    pub terminated: BTreeSet<u32>,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.terminated.is_empty()
    }
}

pub trait ProcessRegistry: Send {
    /// Report what changed in the local JVM table since the last call.
    fn poll(&mut self) -> Result<RegistryDelta, Error>;
}

pub trait MetadataExtractor: Send + Sync {
    /// Resolve metadata through the process's local monitoring channel. The
    /// process may already be gone, in which case an error is returned.
    fn extract(&self, pid: u32) -> Result<VmMetadata, Error>;
}
