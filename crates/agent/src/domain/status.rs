#![forbid(unsafe_code)]

use std::fmt;

/// Lifecycle transition reported to [`crate::notifier::VmStatusListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStatus {
    /// The VM appeared after the listener was registered.
    Started,
    /// The VM went away.
    Stopped,
    /// The VM was already running when the listener was registered. Only the
    /// notifier produces this status.
    Active,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmStatus::Started => "started",
            VmStatus::Stopped => "stopped",
            VmStatus::Active => "active",
        };
        f.write_str(name)
    }
}
