// src/diagnostics/mod.rs
// Read-only environment probe used to explain start failures

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::frp::installer::Architecture;
use crate::frp::types::{EndpointSpec, TunnelServerConfig, TunnelStatus, AGENT_VERSION};
use crate::process::types::LaunchMethod;
use crate::settings::Settings;
use crate::utils::command::{is_executable, probe_shells, ShellCapability};
use crate::utils::network::{probe_tcp, ProbeResult};

pub const LOW_MEMORY_MB: u64 = 100;
const REPORT_LOG_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    MinorWarnings,
    MultipleWarnings,
    CriticalIssues,
}

/// Any issue is critical; otherwise the warning count decides.
pub fn derive_status(issues: &[String], warnings: &[String]) -> HealthStatus {
    if !issues.is_empty() {
        return HealthStatus::CriticalIssues;
    }
    match warnings.len() {
        0 => HealthStatus::Healthy,
        1 => HealthStatus::MinorWarnings,
        _ => HealthStatus::MultipleWarnings,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BinaryState {
    pub path: PathBuf,
    pub exists: bool,
    pub executable: bool,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
}

impl BinaryState {
    pub fn inspect(path: &Path) -> Self {
        let metadata = std::fs::metadata(path).ok();
        let sha256 = std::fs::read(path).ok().map(|bytes| {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        });

        Self {
            path: path.to_path_buf(),
            exists: metadata.is_some(),
            executable: is_executable(path),
            size_bytes: metadata.map(|m| m.len()),
            sha256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerProbe {
    pub address: String,
    pub result: ProbeResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointProbe {
    pub id: String,
    pub target: String,
    pub result: ProbeResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub architecture: Architecture,
    pub architecture_fallback: bool,
    pub os: String,
    pub os_version: String,
    pub agent_version: String,
    pub binary: BinaryState,
    pub mirror: Option<BinaryState>,
    pub server: Option<ServerProbe>,
    pub endpoints: Vec<EndpointProbe>,
    pub available_memory_mb: Option<u64>,
    pub data_dir_writable: bool,
    pub shells: Vec<ShellCapability>,
    pub current_method: Option<LaunchMethod>,
    pub tunnel: TunnelStatus,
    pub recent_logs: Vec<String>,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub status: HealthStatus,
}

/// Everything the probe needs, copied out of the supervisor.
#[derive(Debug, Clone)]
pub struct DiagnosticsInput {
    pub settings: Settings,
    pub architecture: (Architecture, bool),
    pub server: Option<TunnelServerConfig>,
    pub endpoints: Vec<EndpointSpec>,
    pub tunnel: TunnelStatus,
    pub recent_logs: Vec<String>,
}

struct LocalFacts {
    os_version: String,
    binary: BinaryState,
    mirror: Option<BinaryState>,
    available_memory_mb: Option<u64>,
    data_dir_writable: bool,
    shells: Vec<ShellCapability>,
}

fn local_facts(settings: &Settings) -> LocalFacts {
    LocalFacts {
        os_version: os_version(),
        binary: BinaryState::inspect(&settings.binary_path()),
        mirror: settings.mirror_binary_path().map(|path| BinaryState::inspect(&path)),
        available_memory_mb: available_memory_mb(),
        data_dir_writable: is_dir_writable(&settings.data_dir),
        shells: probe_shells(&settings.alternate_shells),
    }
}

pub fn os_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// `MemAvailable` from /proc/meminfo, in MB.
pub fn available_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Whether `dir` could be written, judged at its nearest existing ancestor so
/// nothing is created. The probe file is removed when dropped.
fn is_dir_writable(dir: &Path) -> bool {
    let Some(existing) = dir.ancestors().find(|candidate| candidate.is_dir()) else {
        return false;
    };
    tempfile::NamedTempFile::new_in(existing).is_ok()
}

/// Collect the report. Never touches the running agent or persisted state.
pub async fn collect(input: DiagnosticsInput) -> DiagnosticsReport {
    let timeout = input.settings.probe_timeout();
    let settings = input.settings.clone();
    let local = match tokio::task::spawn_blocking(move || local_facts(&settings)).await {
        Ok(facts) => facts,
        Err(e) => {
            log::error!("Local diagnostics probe failed: {}", e);
            local_facts_fallback(&input.settings)
        }
    };

    let server = match &input.server {
        Some(server) => Some(ServerProbe {
            address: server.address(),
            result: probe_tcp(&server.server_addr, server.server_port, timeout).await,
        }),
        None => None,
    };

    let endpoint_probes = input.endpoints.iter().filter(|e| e.enabled).map(|endpoint| async move {
        EndpointProbe {
            id: endpoint.id.clone(),
            target: format!("{}:{}", endpoint.local_host, endpoint.local_port),
            result: probe_tcp(&endpoint.local_host, endpoint.local_port, timeout).await,
        }
    });
    let endpoints = join_all(endpoint_probes).await;

    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if !local.binary.exists {
        issues.push(format!("Agent binary missing at {:?}", local.binary.path));
    } else if !local.binary.executable {
        issues.push(format!("Agent binary at {:?} is not executable", local.binary.path));
    }
    if !local.data_dir_writable {
        issues.push(format!("Data directory {:?} is not writable", input.settings.data_dir));
    }
    match &server {
        Some(probe) if !probe.result.is_reachable() => {
            issues.push(format!("Tunnel server {} unreachable: {:?}", probe.address, probe.result));
        }
        Some(_) => {}
        None => warnings.push("No server config saved".to_string()),
    }

    if !input.endpoints.iter().any(|e| e.enabled) {
        warnings.push("No enabled endpoints".to_string());
    }
    if input.architecture.1 {
        warnings.push(format!(
            "Unrecognized CPU architecture '{}', using {} agent",
            std::env::consts::ARCH,
            input.architecture.0
        ));
    }
    if let Some(mirror) = &local.mirror {
        if !mirror.exists {
            warnings.push(format!("Mirror copy missing at {:?}", mirror.path));
        }
    }
    if let Some(mb) = local.available_memory_mb {
        if mb < LOW_MEMORY_MB {
            warnings.push(format!("Low available memory: {} MB", mb));
        }
    }
    if !local.shells.iter().any(|s| s.present && s.executable) {
        warnings.push("No usable alternate shell found".to_string());
    }
    if input.tunnel.is_running && input.tunnel.method == Some(LaunchMethod::Simulation) {
        warnings.push("Tunnel is running in simulation mode: no real tunneling".to_string());
    }
    for probe in endpoints.iter().filter(|p| !p.result.is_reachable()) {
        warnings.push(format!("Endpoint {} ({}) not reachable locally", probe.id, probe.target));
    }

    let status = derive_status(&issues, &warnings);
    log::info!(
        "Diagnostics: {:?} ({} issues, {} warnings)",
        status,
        issues.len(),
        warnings.len()
    );

    let start = input.recent_logs.len().saturating_sub(REPORT_LOG_LINES);
    DiagnosticsReport {
        generated_at: Utc::now(),
        architecture: input.architecture.0,
        architecture_fallback: input.architecture.1,
        os: std::env::consts::OS.to_string(),
        os_version: local.os_version,
        agent_version: AGENT_VERSION.to_string(),
        binary: local.binary,
        mirror: local.mirror,
        server,
        endpoints,
        available_memory_mb: local.available_memory_mb,
        data_dir_writable: local.data_dir_writable,
        shells: local.shells,
        current_method: input.tunnel.method,
        recent_logs: input.recent_logs[start..].to_vec(),
        tunnel: input.tunnel,
        issues,
        warnings,
        status,
    }
}

fn local_facts_fallback(settings: &Settings) -> LocalFacts {
    LocalFacts {
        os_version: "unknown".to_string(),
        binary: BinaryState {
            path: settings.binary_path(),
            exists: false,
            executable: false,
            size_bytes: None,
            sha256: None,
        },
        mirror: None,
        available_memory_mb: None,
        data_dir_writable: false,
        shells: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frp::types::TunnelRuntimeState;
    use std::net::TcpListener;

    fn input(settings: Settings, server: Option<TunnelServerConfig>) -> DiagnosticsInput {
        DiagnosticsInput {
            settings,
            architecture: (Architecture::X86_64, false),
            server,
            endpoints: Vec::new(),
            tunnel: TunnelStatus::from(&TunnelRuntimeState::default()),
            recent_logs: vec!["[I] hello".to_string()],
        }
    }

    #[test]
    fn test_status_derivation() {
        let none: Vec<String> = Vec::new();
        let one = vec!["w".to_string()];
        let two = vec!["w".to_string(), "x".to_string()];
        assert_eq!(derive_status(&none, &none), HealthStatus::Healthy);
        assert_eq!(derive_status(&none, &one), HealthStatus::MinorWarnings);
        assert_eq!(derive_status(&none, &two), HealthStatus::MultipleWarnings);
        assert_eq!(derive_status(&one, &none), HealthStatus::CriticalIssues);
    }

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:       16314720 kB\nMemFree:  1000 kB\nMemAvailable:    2097152 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(2048));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::MultipleWarnings).unwrap(),
            "\"MULTIPLE_WARNINGS\""
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let report = collect(input(Settings::rooted_at(dir.path()), None)).await;

        assert!(!report.binary.exists);
        assert_eq!(report.status, HealthStatus::CriticalIssues);
        assert!(report.issues.iter().any(|i| i.contains("missing")));
        assert!(report.warnings.iter().any(|w| w.contains("No server config")));
        assert_eq!(report.recent_logs, vec!["[I] hello".to_string()]);
    }

    #[tokio::test]
    async fn test_collect_does_not_create_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let data_dir = settings.data_dir.clone();
        assert!(!data_dir.exists());

        let report = collect(input(settings, None)).await;
        assert!(report.data_dir_writable);
        assert!(!data_dir.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reachable_server_and_installed_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        std::fs::create_dir_all(&settings.data_dir).unwrap();
        std::fs::write(settings.binary_path(), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(settings.binary_path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = TunnelServerConfig::new("127.0.0.1", port, "tok");

        let report = collect(input(settings, Some(server))).await;
        assert!(report.binary.executable);
        assert_eq!(report.binary.sha256.as_deref().map(str::len), Some(64));
        assert!(report.server.as_ref().unwrap().result.is_reachable());
        assert!(report.data_dir_writable);
        assert!(report.issues.is_empty(), "unexpected issues: {:?}", report.issues);
        assert_ne!(report.status, HealthStatus::CriticalIssues);
    }
}
