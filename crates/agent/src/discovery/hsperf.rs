#![forbid(unsafe_code)]

use crate::discovery::perfdata::{self, PerfCounters};
use crate::discovery::{MetadataExtractor, ProcessRegistry, RegistryDelta};
use crate::domain::VmMetadata;
use crate::error::Error;
use nix::unistd::{Uid, User};
use procfs::process::Process;
use std::collections::BTreeSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const USER_DIR_PREFIX: &str = "hsperfdata_";

const JAVA_COMMAND: &str = "sun.rt.javaCommand";
const JAVA_VERSION: &str = "java.property.java.version";
const JAVA_HOME: &str = "java.property.java.home";
const VM_NAME: &str = "java.property.java.vm.name";
const VM_INFO: &str = "java.property.java.vm.info";
const VM_VERSION: &str = "java.property.java.vm.version";
const VM_ARGS: &str = "java.rt.vmArgs";
const VM_BEGIN_TIME: &str = "sun.rt.createVmBeginTime";

/// Registry backed by the perf-data files HotSpot publishes under
/// `<root>/hsperfdata_<user>/<pid>`.
#[derive(Debug)]
pub struct HsperfRegistry {
    root: PathBuf,
    proc_root: PathBuf,
    known: BTreeSet<u32>,
}

impl HsperfRegistry {
    pub fn connect(root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::read_dir(&root).map_err(|err| Error::RegistryUnavailable {
            path: root.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            root,
            proc_root: proc_root.into(),
            known: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pids with a perf-data file whose process is still alive.
    pub fn live_pids(&self) -> Result<BTreeSet<u32>, Error> {
        let mut pids = BTreeSet::new();
        for dir in user_dirs(&self.root)? {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    // Other users' directories are commonly unreadable.
                    trace!(path = %dir.display(), %err, "skipping perf-data directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                if self.proc_root.join(pid.to_string()).exists() {
                    pids.insert(pid);
                }
            }
        }
        Ok(pids)
    }
}

impl ProcessRegistry for HsperfRegistry {
    fn poll(&mut self) -> Result<RegistryDelta, Error> {
        let live = self.live_pids()?;
        let delta = RegistryDelta {
            started: live.difference(&self.known).copied().collect(),
            terminated: self.known.difference(&live).copied().collect(),
        };
        if !delta.is_empty() {
            debug!(?delta, "registry changed");
        }
        self.known = live;
        Ok(delta)
    }
}

fn user_dirs(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = std::fs::read_dir(root).map_err(|err| Error::RegistryUnavailable {
        path: root.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(USER_DIR_PREFIX))
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect())
}

fn locate(root: &Path, pid: u32) -> Result<Option<PathBuf>, Error> {
    let name = pid.to_string();
    Ok(user_dirs(root)?
        .into_iter()
        .map(|dir| dir.join(&name))
        .find(|path| path.is_file()))
}

/// Resolves metadata from a VM's perf-data counters and its procfs entry.
#[derive(Debug, Clone)]
pub struct PerfDataExtractor {
    hsperfdata_root: PathBuf,
    proc_root: PathBuf,
}

impl PerfDataExtractor {
    pub fn new(hsperfdata_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            hsperfdata_root: hsperfdata_root.into(),
            proc_root: proc_root.into(),
        }
    }

    fn process(&self, pid: u32) -> Option<Process> {
        Process::new_with_root(self.proc_root.join(pid.to_string())).ok()
    }

    fn start_time_from_proc(process: &Process) -> Option<u64> {
        let stat = process.stat().ok()?;
        let boot = procfs::boot_time_secs().ok()?;
        let ticks = procfs::ticks_per_second();
        if ticks == 0 {
            return None;
        }
        Some(boot * 1000 + stat.starttime * 1000 / ticks)
    }
}

impl MetadataExtractor for PerfDataExtractor {
    fn extract(&self, pid: u32) -> Result<VmMetadata, Error> {
        let path = locate(&self.hsperfdata_root, pid)?.ok_or(Error::PerfDataMissing(pid))?;
        let buf = std::fs::read(&path)?;
        let counters = perfdata::parse(&buf)?;
        let process = self.process(pid);

        let mut metadata = metadata_from_counters(&counters);
        if metadata.start_time == 0 {
            metadata.start_time = process
                .as_ref()
                .and_then(Self::start_time_from_proc)
                .unwrap_or(0);
        }

        metadata.uid = match process.as_ref().map(Process::uid) {
            Some(Ok(uid)) => Some(uid),
            _ => std::fs::metadata(&path).ok().map(|meta| meta.uid()),
        };
        metadata.username = metadata.uid.and_then(|uid| {
            User::from_uid(Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|user| user.name)
        });

        trace!(pid, main_class = %metadata.main_class, uid = ?metadata.uid, "resolved vm metadata");
        Ok(metadata)
    }
}

fn metadata_from_counters(counters: &PerfCounters) -> VmMetadata {
    let mut metadata = VmMetadata::default();
    let mut set = |field: &mut String, key: &str| {
        if let Some(value) = counters.text(key).filter(|v| !v.is_empty()) {
            *field = value.to_string();
        }
    };
    set(&mut metadata.command_line, JAVA_COMMAND);
    set(&mut metadata.java_version, JAVA_VERSION);
    set(&mut metadata.java_home, JAVA_HOME);
    set(&mut metadata.jvm_name, VM_NAME);
    set(&mut metadata.jvm_info, VM_INFO);
    set(&mut metadata.jvm_version, VM_VERSION);
    set(&mut metadata.jvm_arguments, VM_ARGS);

    // For `java -jar app.jar` the command starts with the jar path.
    if let Some(main) = counters
        .text(JAVA_COMMAND)
        .and_then(|cmd| cmd.split_whitespace().next())
    {
        metadata.main_class = main.to_string();
    }
    metadata.start_time = counters
        .long(VM_BEGIN_TIME)
        .and_then(|t| u64::try_from(t).ok())
        .unwrap_or(0);
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::perfdata::fixture::{Counter, encode};
    use tempfile::{TempDir, tempdir};

    struct Host {
        hsperf: TempDir,
        proc: TempDir,
    }

    impl Host {
        fn new() -> Self {
            Self {
                hsperf: tempdir().unwrap(),
                proc: tempdir().unwrap(),
            }
        }

        fn spawn(&self, user: &str, pid: u32, command: &str) {
            let dir = self.hsperf.path().join(format!("hsperfdata_{user}"));
            std::fs::create_dir_all(&dir).unwrap();
            let buf = encode(
                &[
                    Counter::Text(JAVA_COMMAND, command),
                    Counter::Text(JAVA_VERSION, "17.0.9"),
                    Counter::Text(VM_NAME, "OpenJDK 64-Bit Server VM"),
                    Counter::Text(VM_ARGS, "-Xmx512m"),
                    Counter::Long(VM_BEGIN_TIME, 1_650_000_000_000),
                ],
                false,
            );
            std::fs::write(dir.join(pid.to_string()), buf).unwrap();
            std::fs::create_dir_all(self.proc.path().join(pid.to_string())).unwrap();
        }

        fn kill(&self, pid: u32) {
            std::fs::remove_dir_all(self.proc.path().join(pid.to_string())).unwrap();
        }
    }

    #[test]
    fn connect_fails_without_root() {
        let dir = tempdir().unwrap();
        let err = HsperfRegistry::connect(dir.path().join("missing"), "/proc").unwrap_err();
        assert!(matches!(err, Error::RegistryUnavailable { .. }));
    }

    #[test]
    fn poll_reports_deltas() {
        let host = Host::new();
        let mut registry = HsperfRegistry::connect(host.hsperf.path(), host.proc.path()).unwrap();
        assert!(registry.poll().unwrap().is_empty());

        host.spawn("duke", 100, "com.example.A");
        host.spawn("tux", 200, "com.example.B");
        let delta = registry.poll().unwrap();
        assert_eq!(delta.started, BTreeSet::from([100, 200]));
        assert!(delta.terminated.is_empty());

        assert!(registry.poll().unwrap().is_empty());

        host.kill(100);
        let delta = registry.poll().unwrap();
        assert!(delta.started.is_empty());
        assert_eq!(delta.terminated, BTreeSet::from([100]));
    }

    #[test]
    fn stale_and_foreign_files_are_ignored() {
        let host = Host::new();
        let dir = host.hsperf.path().join("hsperfdata_duke");
        std::fs::create_dir_all(&dir).unwrap();
        // Left behind by a crashed VM: no procfs entry.
        std::fs::write(dir.join("4242"), b"stale").unwrap();
        std::fs::write(dir.join("not-a-pid"), b"").unwrap();
        std::fs::create_dir_all(host.hsperf.path().join("other")).unwrap();
        std::fs::write(host.hsperf.path().join("other").join("7"), b"").unwrap();
        std::fs::create_dir_all(host.proc.path().join("7")).unwrap();

        let registry = HsperfRegistry::connect(host.hsperf.path(), host.proc.path()).unwrap();
        assert!(registry.live_pids().unwrap().is_empty());
    }

    #[test]
    fn extracts_metadata_from_counters() {
        let host = Host::new();
        host.spawn("duke", 321, "/opt/app/server.jar --port 9000");
        let extractor = PerfDataExtractor::new(host.hsperf.path(), host.proc.path());

        let metadata = extractor.extract(321).unwrap();
        assert_eq!(metadata.main_class, "/opt/app/server.jar");
        assert_eq!(metadata.command_line, "/opt/app/server.jar --port 9000");
        assert_eq!(metadata.java_version, "17.0.9");
        assert_eq!(metadata.jvm_name, "OpenJDK 64-Bit Server VM");
        assert_eq!(metadata.jvm_arguments, "-Xmx512m");
        assert_eq!(metadata.java_home, "unknown");
        assert_eq!(metadata.start_time, 1_650_000_000_000);
        assert_eq!(metadata.uid, Some(nix::unistd::geteuid().as_raw()));
    }

    #[test]
    fn missing_perf_file_is_reported() {
        let host = Host::new();
        let extractor = PerfDataExtractor::new(host.hsperf.path(), host.proc.path());
        assert!(matches!(
            extractor.extract(999),
            Err(Error::PerfDataMissing(999))
        ));
    }

    #[test]
    fn corrupt_perf_file_is_an_error() {
        let host = Host::new();
        let dir = host.hsperf.path().join("hsperfdata_duke");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("55"), [0u8; 8]).unwrap();
        let extractor = PerfDataExtractor::new(host.hsperf.path(), host.proc.path());
        assert!(matches!(extractor.extract(55), Err(Error::PerfData(_))));
    }
}
