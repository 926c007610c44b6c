#![forbid(unsafe_code)]

use crate::domain::VmStatus;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0:?} is derived by the notifier and cannot be published")]
    InvalidStatus(VmStatus),

    #[error("monitoring facility at {path} is unavailable: {reason}")]
    RegistryUnavailable { path: PathBuf, reason: String },

    #[error("no perf data found for pid {0}")]
    PerfDataMissing(u32),

    #[error("malformed perf data: {0}")]
    PerfData(String),

    #[error("metadata extraction for pid {pid} failed: {reason}")]
    Metadata { pid: u32, reason: String },

    #[error("invalid blacklist pattern `{pattern}`: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("gateway request to {path} failed: {reason}")]
    Gateway { path: String, reason: String },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("procfs error: {0}")]
    Procfs(#[from] procfs::ProcError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
