#![forbid(unsafe_code)]

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use config::Config;
use std::path::{Path, PathBuf};
use tracing::trace;

pub const CONFIG_FILE: &str = "/etc/jvm-agent/config.toml";
pub const CONFIG_DIR_GLOB: &str = "/etc/jvm-agent/config.d/*.toml";

/// jvm-agent: host agent that discovers running JVMs and samples them
///
/// jvm-agent watches the HotSpot perf-data directories for JVMs starting and
/// stopping, and drives per-VM metric collectors (I/O, CPU) for every JVM that
/// is not blacklisted.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/jvm-agent/config.toml` and `/etc/jvm-agent/config.d/*.toml`,
    /// where the latter being a glob pattern. If they don't exist, the default
    /// configuration is used. `JVM_AGENT_*` environment variables override
    /// file values either way.
    #[arg(short, long, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    /// Directory holding the `hsperfdata_<user>` directories.
    #[arg(long, value_parser = validate_dir)]
    pub hsperfdata_root: Option<PathBuf>,

    /// Identity to report samples under instead of a random one.
    #[arg(short, long, value_parser = validate_writer_id)]
    pub writer_id: Option<String>,

    /// Do not look for JVMs. Metric backends still run.
    #[arg(long)]
    pub no_discovery: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

impl Cli {
    /// Resolve the effective configuration: files, then environment, then
    /// command line flags.
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let config = match &self.config {
            Some(path) => Config::load(path)?,
            None => {
                let mut candidates = glob::glob(CONFIG_DIR_GLOB)?
                    .filter_map(Result::ok)
                    .collect::<Vec<_>>();
                candidates.insert(0, CONFIG_FILE.into());
                trace!(?candidates, "config file candidates");
                Config::load_multiple(candidates)?
            }
        };
        let mut config = config.with_env_overrides()?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(root) = &self.hsperfdata_root {
            config.discovery.hsperfdata_root = root.clone();
        }
        if let Some(id) = &self.writer_id {
            config.agent.writer_id = Some(id.clone());
        }
        if self.no_discovery {
            config.discovery.enabled = false;
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[inline(always)]
fn validate_dir(dir: &str) -> Result<PathBuf, String> {
    let path = Path::new(dir);
    if path.is_dir() {
        Ok(path.to_owned())
    } else {
        Err(format!("Not a directory: {:?}", path))
    }
}

/// Writer ids end up in request paths, so blanks are rejected.
#[inline(always)]
fn validate_writer_id(id: &str) -> Result<String, String> {
    let id = id.trim();
    if id.is_empty() {
        Err("Writer id must not be blank".to_string())
    } else {
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn flags_override_file_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[agent]\nwriter_id = \"from-file\"\n[discovery]\nenabled = true\npoll_interval = 250\n",
        )
        .unwrap();
        let root = dir.path().to_str().unwrap();

        let cli = Cli::parse_from([
            "jvm-agent",
            "--config",
            path.to_str().unwrap(),
            "--hsperfdata-root",
            root,
            "--writer-id",
            "from-flag",
            "--no-discovery",
        ]);
        let config = cli.load_config().unwrap();

        assert_eq!(config.agent.writer_id.as_deref(), Some("from-flag"));
        assert_eq!(config.discovery.hsperfdata_root, dir.path());
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.poll_interval.as_millis(), 250);
    }

    #[test]
    fn file_values_survive_without_flags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nwriter_id = \"from-file\"\n").unwrap();

        let cli = Cli::parse_from(["jvm-agent", "-c", path.to_str().unwrap()]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.agent.writer_id.as_deref(), Some("from-file"));
        assert!(config.discovery.enabled);
    }

    #[test]
    fn missing_paths_are_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["jvm-agent", "--config", "/nonexistent/agent.toml"]).is_err());
        assert!(Cli::try_parse_from(["jvm-agent", "--hsperfdata-root", "/nonexistent/tmp"]).is_err());
    }

    proptest! {
        #[test]
        fn test_validate_writer_id(id in ".*") {
            match validate_writer_id(&id) {
                Ok(valid) => {
                    prop_assert!(!valid.is_empty());
                    prop_assert_eq!(valid.as_str(), id.trim());
                }
                Err(err) => {
                    prop_assert!(id.trim().is_empty());
                    prop_assert_eq!(err, "Writer id must not be blank");
                }
            }
        }
    }
}
