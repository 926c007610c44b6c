#![forbid(unsafe_code)]

//! Per-metric backends shipped with the agent.

pub mod cpu;
pub mod io;

pub use cpu::{CpuListenerFactory, VmCpuStat};
pub use io::{IoStatAction, VmIoStat};
