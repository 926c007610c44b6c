#![forbid(unsafe_code)]

#[cfg(unix)]
mod unix {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::process::{Child, Command, Output, Stdio};
    use std::thread::sleep;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[test]
    fn signals_trigger_dump_reload_and_shutdown() -> io::Result<()> {
        let dir = tempdir()?;
        let hsperfdata = dir.path().join("tmp");
        fs::create_dir(&hsperfdata)?;
        let config_path = dir.path().join("config.toml");
        write_config(&config_path, &hsperfdata, &[])?;

        let child = Command::new(env!("CARGO_BIN_EXE_jvm-agent"))
            .arg("--config")
            .arg(&config_path)
            .arg("-v")
            .env("JVM_AGENT_LOG", "info")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = Pid::from_raw(child.id() as i32);
        sleep(Duration::from_millis(400));

        kill(pid, Signal::SIGUSR1).ok();
        sleep(Duration::from_millis(400));

        write_config(&config_path, &hsperfdata, &["org.gradle.*"])?;
        kill(pid, Signal::SIGHUP).ok();
        sleep(Duration::from_millis(400));

        kill(pid, Signal::SIGUSR1).ok();
        sleep(Duration::from_millis(400));

        kill(pid, Signal::SIGTERM).ok();
        let output = wait_for_output(child)?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        assert!(output.status.success(), "{combined}");
        assert!(combined.contains("config reloaded"));
        assert!(combined.matches("agent status").count() >= 2);
        assert!(combined.matches("current config").count() >= 2);
        assert!(combined.contains("jvm-agent stopped"));

        Ok(())
    }

    #[test]
    fn interrupt_exits_cleanly_without_discovery() -> io::Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.toml");
        write_config(&config_path, dir.path(), &[])?;

        let child = Command::new(env!("CARGO_BIN_EXE_jvm-agent"))
            .arg("--config")
            .arg(&config_path)
            .arg("--no-discovery")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        sleep(Duration::from_millis(300));
        kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).ok();
        let output = wait_for_output(child)?;
        assert!(output.status.success());

        Ok(())
    }

    fn write_config(path: &Path, hsperfdata: &Path, blacklist: &[&str]) -> io::Result<()> {
        let blacklist = blacklist
            .iter()
            .map(|pattern| format!("\"{pattern}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let contents = format!(
            "[agent]\nwriter_id = \"signals-test\"\nshutdown_grace = 2000\n\n\
[discovery]\n\
poll_interval = 100\n\
hsperfdata_root = \"{}\"\n\
blacklist = [{blacklist}]\n\n\
[gateway]\n\
enabled = false\n",
            hsperfdata.display()
        );
        fs::write(path, contents)
    }

    fn wait_for_output(mut child: Child) -> io::Result<Output> {
        let start = Instant::now();
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if start.elapsed() > Duration::from_secs(10) {
                let _ = child.kill();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "jvm-agent process did not exit",
                ));
            }
            sleep(Duration::from_millis(50));
        }
        child.wait_with_output()
    }
}

#[cfg(not(unix))]
#[test]
fn signals_trigger_dump_reload_and_shutdown() {
    // Signals are only supported in the Unix build.
}
