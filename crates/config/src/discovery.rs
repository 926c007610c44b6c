use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Discovery {
    /// Whether the agent should look for JVMs at all. With discovery off the
    /// per-metric backends still run but never see a VM.
    pub enabled: bool,

    /// How often the perf-data directories are rescanned for started and
    /// terminated JVMs. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub poll_interval: Duration,

    /// Directory holding the `hsperfdata_<user>` directories. HotSpot writes
    /// these under the system temp dir unless `-Djava.io.tmpdir` says
    /// otherwise.
    pub hsperfdata_root: PathBuf,

    /// Mount point of procfs, used to tell live pids from stale perf files.
    pub proc_root: PathBuf,

    /// Main-class patterns that must never be monitored.
    ///
    /// Each entry is one of:
    ///
    /// - `re:<regex>`: the main class matches the regular expression,
    /// - `<prefix>*`: the main class starts with `<prefix>`,
    /// - anything else: the main class is exactly this string.
    ///
    /// For `java -jar app.jar` the main class is the jar path.
    pub blacklist: Vec<String>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(1000),
            hsperfdata_root: std::env::temp_dir(),
            proc_root: PathBuf::from("/proc"),
            blacklist: Vec::new(),
        }
    }
}
