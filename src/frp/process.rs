use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::process::monitor::{ControlSignal, ExitInfo, RunningHandle};
use crate::process::types::LaunchMethod;

/// The agent of the current run, as seen by the supervisor.
pub struct AgentProcess {
    handle: RunningHandle,
    pub strategy_index: usize,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AgentProcess {
    pub fn new(handle: RunningHandle, strategy_index: usize) -> Self {
        Self {
            handle,
            strategy_index,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    pub fn method(&self) -> LaunchMethod {
        self.handle.method
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.handle.exit_watch()
    }

    /// Graceful signal, then a forced kill if nothing happened within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<Option<i32>, String> {
        if let Some(info) = self.handle.exit_info() {
            return Ok(info.code);
        }

        log::info!("Stopping agent ({}, pid {:?})", self.method(), self.pid());
        self.handle.signal(ControlSignal::Terminate);
        if let Ok(Some(info)) = tokio::time::timeout(timeout, self.handle.wait_exit()).await {
            return Ok(info.code);
        }

        log::warn!("Agent did not exit within {:?}, force killing", timeout);
        self.handle.signal(ControlSignal::Kill);
        match tokio::time::timeout(timeout, self.handle.wait_exit()).await {
            Ok(Some(info)) => Ok(info.code),
            Ok(None) => Err("agent monitor ended without reporting an exit".to_string()),
            Err(_) => Err(format!("agent still running {:?} after forced kill", timeout)),
        }
    }
}

/// Kill processes left over from earlier runs that have one of `paths` as a
/// whole argument (usually argv[0]). Returns how many were signalled.
pub fn kill_strays(paths: &[PathBuf]) -> usize {
    let needles: Vec<String> = paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .collect();
    if needles.is_empty() {
        return 0;
    }

    platform::kill_matching(&needles)
}

#[cfg(target_os = "linux")]
mod platform {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    pub fn kill_matching(needles: &[String]) -> usize {
        let own_pid = std::process::id();
        let entries = match std::fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot scan /proc for stray agents: {}", e);
                return 0;
            }
        };

        let mut killed = 0;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            if !argv_mentions(&raw, needles) {
                continue;
            }
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");

            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    log::info!("Killed stray agent process {} ({})", pid, cmdline.trim());
                    killed += 1;
                }
                Err(e) => log::debug!("Could not kill stray process {}: {}", pid, e),
            }
        }
        killed
    }

    /// True when one argument of a NUL-separated argv is exactly one of `needles`.
    pub(super) fn argv_mentions(raw: &[u8], needles: &[String]) -> bool {
        raw.split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .any(|arg| needles.iter().any(|needle| arg == needle.as_bytes()))
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use std::process::Command;

    pub fn kill_matching(needles: &[String]) -> usize {
        let mut killed = 0;
        for needle in needles {
            // The path must be a whole word of the command line, not a prefix of another file
            let pattern = format!("(^|[[:space:]]){}([[:space:]]|$)", escape_ere(needle));
            match Command::new("pkill").arg("-9").arg("-f").arg(&pattern).status() {
                // pkill exits 0 when at least one process matched
                Ok(status) if status.success() => killed += 1,
                Ok(_) => {}
                Err(e) => log::debug!("pkill unavailable: {}", e),
            }
        }
        killed
    }

    fn escape_ere(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len());
        for c in text.chars() {
            if ".[]()*+?{}|^$\\".contains(c) {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }
}

#[cfg(not(unix))]
mod platform {
    pub fn kill_matching(_needles: &[String]) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frp::events::EventHub;
    use crate::process::monitor::{attach, MonitorTimings};
    use crate::process::strategies::Launched;

    fn timings() -> MonitorTimings {
        MonitorTimings {
            native_poll_interval: Duration::from_millis(20),
            simulation_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_stop_simulated_agent() {
        let handle = attach(Launched::Simulation, LaunchMethod::Simulation, EventHub::new(), timings());
        let agent = AgentProcess::new(handle, 7);
        assert!(agent.method().is_simulation());
        assert_eq!(agent.pid(), None);

        assert_eq!(agent.stop(Duration::from_secs(1)).await, Ok(Some(0)));
        // Second stop sees the recorded exit
        assert_eq!(agent.stop(Duration::from_secs(1)).await, Ok(Some(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        use crate::process::types::StrategyKind;

        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.1; done")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let handle = attach(
            Launched::Child(child),
            LaunchMethod::Real(StrategyKind::DirectExec),
            EventHub::new(),
            timings(),
        );
        let agent = AgentProcess::new(handle, 1);

        let result = agent.stop(Duration::from_millis(300)).await;
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_kill_strays_ignores_empty_paths() {
        assert_eq!(kill_strays(&[]), 0);
        assert_eq!(kill_strays(&[PathBuf::new()]), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_argv_must_contain_exact_path() {
        let needles = vec!["/data/frpc".to_string()];
        assert!(platform::argv_mentions(b"/data/frpc\0-c\0/data/frpc.ini\0", &needles));
        assert!(platform::argv_mentions(b"/bin/sh\0/data/frpc\0", &needles));
        assert!(!platform::argv_mentions(b"tail\0-f\0/data/frpc.ini\0", &needles));
        assert!(!platform::argv_mentions(b"/bin/sh\0-c\0sleep 30; cat /data/frpc\0", &needles));
        assert!(!platform::argv_mentions(b"", &needles));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_strays_matches_installed_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("frpc");
        std::fs::write(&agent, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        // The shell interpreting the script keeps the path as its first argument
        let mut child = std::process::Command::new("/bin/sh").arg(&agent).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(kill_strays(&[agent]) >= 1);
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_strays_leaves_config_viewers_alone() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("frpc");
        let config = dir.path().join("frpc.ini");
        std::fs::write(&config, "[common]\n").unwrap();

        let mut viewer = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30; cat \"$0\"")
            .arg(&config)
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(kill_strays(&[agent]), 0);
        assert!(viewer.try_wait().unwrap().is_none());

        viewer.kill().unwrap();
        let _ = viewer.wait();
    }
}
