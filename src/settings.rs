// src/settings.rs
// Supervisor configuration, read from YAML with defaults for every field

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frp::types::TunnelMode;

pub const DATA_DIR_ENV: &str = "TUNNEL_SUPERVISOR_DATA_DIR";
const APP_DIR_NAME: &str = "tunnel-supervisor";

/// Bounded restart behaviour after an unexpected agent exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub same_strategy_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            same_strategy_retries: 1,
            initial_backoff_ms: 5000,
            max_backoff_ms: 60_000,
            multiplier: 2,
        }
    }
}

impl RestartPolicy {
    /// Backoff before restart number `restart` (1-based).
    pub fn backoff_for(&self, restart: u32) -> Duration {
        let exponent = restart.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let millis = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub mirror_dir: Option<PathBuf>,
    pub artifact_dir: PathBuf,
    pub binary_name: String,
    pub config_file_name: String,
    pub grace_window_ms: u64,
    pub stop_timeout_ms: u64,
    pub native_poll_interval_ms: u64,
    pub simulation_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub alternate_shells: Vec<PathBuf>,
    pub launchers: Vec<LauncherSpec>,
    pub tunnel_mode: TunnelMode,
    pub restart: RestartPolicy,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME);
        let mirror_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME);

        Self {
            artifact_dir: data_dir.join("artifacts"),
            data_dir,
            mirror_dir: Some(mirror_dir),
            binary_name: "frpc".to_string(),
            config_file_name: "frpc.ini".to_string(),
            grace_window_ms: 2000,
            stop_timeout_ms: 3000,
            native_poll_interval_ms: 5000,
            simulation_interval_ms: 5000,
            probe_timeout_ms: 5000,
            alternate_shells: vec![
                PathBuf::from("/system/bin/sh"),
                PathBuf::from("/system/xbin/sh"),
                PathBuf::from("/vendor/bin/sh"),
                PathBuf::from("/bin/sh"),
                PathBuf::from("/bin/bash"),
                PathBuf::from("/usr/bin/bash"),
            ],
            launchers: vec![
                LauncherSpec { program: "setsid".to_string(), args: Vec::new() },
                LauncherSpec { program: "env".to_string(), args: Vec::new() },
            ],
            tunnel_mode: TunnelMode::Multi,
            restart: RestartPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let mut settings: Settings = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {:?}", path))?;
        settings.apply_env();
        Ok(settings)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut settings = Self::default();
                settings.apply_env();
                Ok(settings)
            }
        }
    }

    /// Settings rooted in one directory, used by tests and portable installs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            mirror_dir: Some(root.join("mirror")),
            artifact_dir: root.join("artifacts"),
            ..Self::default()
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                log::info!("Using data directory from {}: {}", DATA_DIR_ENV, dir);
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.data_dir.join(&self.binary_name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_file_name)
    }

    pub fn mirror_binary_path(&self) -> Option<PathBuf> {
        self.mirror_dir.as_ref().map(|dir| dir.join(&self.binary_name))
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn native_poll_interval(&self) -> Duration {
        Duration::from_millis(self.native_poll_interval_ms)
    }

    pub fn simulation_interval(&self) -> Duration {
        Duration::from_millis(self.simulation_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.binary_name, "frpc");
        assert_eq!(settings.grace_window(), Duration::from_secs(2));
        assert_eq!(settings.tunnel_mode, TunnelMode::Multi);
        assert!(settings.binary_path().ends_with("frpc"));
        assert!(settings.config_path().ends_with("frpc.ini"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grace_window_ms: 250\ntunnel_mode: single\nrestart:\n  max_restarts: 7").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.grace_window_ms, 250);
        assert_eq!(settings.tunnel_mode, TunnelMode::Single);
        assert_eq!(settings.restart.max_restarts, 7);
        assert_eq!(settings.restart.same_strategy_retries, 1);
        assert_eq!(settings.config_file_name, "frpc.ini");
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grace_window_ms: [not, a, number]").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn test_backoff_escalates_and_caps() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(20));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_rooted_at() {
        let settings = Settings::rooted_at(Path::new("/tmp/sv"));
        assert_eq!(settings.binary_path(), PathBuf::from("/tmp/sv/data/frpc"));
        assert_eq!(settings.mirror_binary_path(), Some(PathBuf::from("/tmp/sv/mirror/frpc")));
    }
}
