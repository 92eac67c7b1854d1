use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process::types::{LaunchMethod, SupervisorState};

pub const MIN_REMOTE_PORT: u16 = 500;
pub const DEFAULT_LOCAL_PORT: u16 = 554;

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)$")
        .expect("static regex")
});

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,62})(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,62}))*$")
        .expect("static regex")
});

// Section names end up between brackets in the ini file
static SECTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Server address is required")]
    MissingServerAddress,

    #[error("Server address must be an IP address or host name, got '{0}'")]
    InvalidServerAddress(String),

    #[error("Valid server port (1-65535) is required")]
    InvalidServerPort,

    #[error("Token is required")]
    MissingToken,

    #[error("Token must be a single line")]
    MultilineToken,

    #[error("Endpoint id '{0}' may only contain letters, digits, '.', '_' and '-'")]
    InvalidId(String),

    #[error("Valid local IP address or host name is required, got '{0}'")]
    InvalidHost(String),

    #[error("Valid local port (1-65535) is required")]
    InvalidLocalPort,

    #[error("Port outside valid range (500-65535): {0}")]
    RemotePortOutOfRange(u16),

    #[error("Port already in use: {0}")]
    DuplicatePort(u16),
}

/// Relay server the agent logs in to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelServerConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub auth_token: String,
}

impl TunnelServerConfig {
    /// Trims user input; validation is separate so callers can list every problem.
    pub fn new(server_addr: &str, server_port: u16, auth_token: &str) -> Self {
        Self {
            server_addr: server_addr.trim().to_string(),
            server_port,
            auth_token: auth_token.trim().to_string(),
        }
    }

    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.server_addr.trim().is_empty() {
            errors.push(ValidationError::MissingServerAddress);
        } else if !is_valid_host(&self.server_addr) {
            errors.push(ValidationError::InvalidServerAddress(self.server_addr.clone()));
        }
        if self.server_port == 0 {
            errors.push(ValidationError::InvalidServerPort);
        }
        if self.auth_token.trim().is_empty() {
            errors.push(ValidationError::MissingToken);
        } else if self.auth_token.contains('\n') || self.auth_token.contains('\r') {
            errors.push(ValidationError::MultilineToken);
        }

        errors
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.validation_errors().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

/// A local service (camera) mapped to a port on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub id: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EndpointSpec {
    pub fn new(id: impl Into<String>, local_host: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            id: id.into(),
            local_host: local_host.into(),
            local_port,
            remote_port,
            enabled: true,
        }
    }

    pub fn generate_id() -> String {
        let raw = Uuid::new_v4().simple().to_string();
        format!("endpoint_{}", &raw[..8])
    }

    /// Checks field ranges only; uniqueness needs the rest of the collection.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !SECTION_RE.is_match(&self.id) || self.id == "common" {
            return Err(ValidationError::InvalidId(self.id.clone()));
        }

        if !is_valid_host(self.local_host.trim()) {
            return Err(ValidationError::InvalidHost(self.local_host.clone()));
        }

        if self.local_port == 0 {
            return Err(ValidationError::InvalidLocalPort);
        }

        validate_remote_port(self.remote_port)
    }

    /// RTSP URL a viewer uses to reach this camera through the relay.
    pub fn stream_url(&self, server: &TunnelServerConfig) -> String {
        format!("rtsp://{}:{}", server.server_addr, self.remote_port)
    }
}

/// IPv4 literal or DNS name. Anything else could break out of an ini value.
fn is_valid_host(host: &str) -> bool {
    IPV4_RE.is_match(host) || HOSTNAME_RE.is_match(host)
}

pub fn validate_remote_port(port: u16) -> Result<(), ValidationError> {
    if port < MIN_REMOTE_PORT {
        Err(ValidationError::RemotePortOutOfRange(port))
    } else {
        Ok(())
    }
}

/// Rejects `candidate` if any endpoint in `existing` (other than `skip_id`) already claims its remote port.
pub fn check_port_unique(
    candidate: u16,
    existing: &[EndpointSpec],
    skip_id: Option<&str>,
) -> Result<(), ValidationError> {
    let taken = existing
        .iter()
        .filter(|e| Some(e.id.as_str()) != skip_id)
        .any(|e| e.remote_port == candidate);

    if taken {
        Err(ValidationError::DuplicatePort(candidate))
    } else {
        Ok(())
    }
}

/// Lowest remote port at or above 500 that no endpoint uses.
pub fn next_available_port(existing: &[EndpointSpec]) -> Option<u16> {
    (MIN_REMOTE_PORT..=u16::MAX).find(|port| !existing.iter().any(|e| e.remote_port == *port))
}

/// Serialized agent configuration, written whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfigArtifact {
    text: String,
    sections: Vec<String>,
}

impl GeneratedConfigArtifact {
    pub(crate) fn new(text: String, sections: Vec<String>) -> Self {
        Self { text, sections }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Endpoint section names in emission order.
    pub fn endpoint_sections(&self) -> &[String] {
        &self.sections
    }
}

/// Whether every enabled endpoint is written, or only the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    #[default]
    Multi,
    Single,
}

/// Authoritative runtime state; only the supervisor mutates it.
#[derive(Debug, Clone, Default)]
pub struct TunnelRuntimeState {
    pub state: SupervisorState,
    pub active_strategy: Option<LaunchMethod>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub strategy_index: Option<usize>,
    pub restart_count: u32,
    pub same_strategy_restarts: u32,
}

impl TunnelRuntimeState {
    pub fn is_running(&self) -> bool {
        self.state == SupervisorState::Running
    }

    pub(crate) fn clear_run(&mut self) {
        self.active_strategy = None;
        self.pid = None;
        self.started_at = None;
        self.run_id = None;
        self.strategy_index = None;
    }
}

/// The three states a UI distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelAvailability {
    Active,
    Simulated,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub state: SupervisorState,
    pub is_running: bool,
    pub method: Option<LaunchMethod>,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

impl TunnelStatus {
    pub fn availability(&self) -> TunnelAvailability {
        match (self.is_running, self.method) {
            (true, Some(LaunchMethod::Real(_))) => TunnelAvailability::Active,
            (true, Some(LaunchMethod::Simulation)) => TunnelAvailability::Simulated,
            _ => TunnelAvailability::Stopped,
        }
    }
}

impl From<&TunnelRuntimeState> for TunnelStatus {
    fn from(runtime: &TunnelRuntimeState) -> Self {
        Self {
            state: runtime.state,
            is_running: runtime.is_running(),
            method: runtime.active_strategy,
            started_at: runtime.started_at,
            pid: runtime.pid,
            restart_count: runtime.restart_count,
        }
    }
}

pub const AGENT_VERSION: &str = "0.52.0";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::StrategyKind;

    fn endpoint(id: &str, remote_port: u16) -> EndpointSpec {
        EndpointSpec::new(id, "192.168.1.10", 554, remote_port)
    }

    #[test]
    fn test_server_config_trims_and_validates() {
        let config = TunnelServerConfig::new("  relay.example.com ", 7000, " secret ");
        assert_eq!(config.server_addr, "relay.example.com");
        assert_eq!(config.auth_token, "secret");
        assert!(config.validate().is_ok());

        let bad = TunnelServerConfig::new("", 0, "");
        assert_eq!(
            bad.validation_errors(),
            vec![
                ValidationError::MissingServerAddress,
                ValidationError::InvalidServerPort,
                ValidationError::MissingToken,
            ]
        );
    }

    #[test]
    fn test_server_address_cannot_carry_extra_lines() {
        let injected = TunnelServerConfig::new("relay.example.com\n[evil]\ntype = tcp", 7000, "tok");
        assert!(matches!(
            injected.validate(),
            Err(ValidationError::InvalidServerAddress(_))
        ));
        assert!(TunnelServerConfig::new("relay example.com", 7000, "tok").validate().is_err());
        assert!(TunnelServerConfig::new("10.0.0.1", 7000, "tok").validate().is_ok());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(endpoint("front", 557).validate().is_ok());
        assert_eq!(
            endpoint("front", 499).validate(),
            Err(ValidationError::RemotePortOutOfRange(499))
        );
        assert!(matches!(endpoint("bad]id", 557).validate(), Err(ValidationError::InvalidId(_))));
        assert!(matches!(endpoint("common", 557).validate(), Err(ValidationError::InvalidId(_))));

        let mut local = endpoint("front", 557);
        local.local_port = 0;
        assert_eq!(local.validate(), Err(ValidationError::InvalidLocalPort));

        let mut host = endpoint("front", 557);
        host.local_host = "not a host".to_string();
        assert!(matches!(host.validate(), Err(ValidationError::InvalidHost(_))));

        host.local_host = "garage-cam.local".to_string();
        assert!(host.validate().is_ok());
    }

    #[test]
    fn test_port_uniqueness_and_next_port() {
        let existing = vec![endpoint("a", 500), endpoint("b", 501), endpoint("c", 503)];
        assert_eq!(
            check_port_unique(501, &existing, None),
            Err(ValidationError::DuplicatePort(501))
        );
        assert!(check_port_unique(501, &existing, Some("b")).is_ok());
        assert_eq!(next_available_port(&existing), Some(502));
        assert_eq!(next_available_port(&[]), Some(500));
    }

    #[test]
    fn test_stream_url() {
        let server = TunnelServerConfig::new("relay.example.com", 7000, "t");
        assert_eq!(endpoint("front", 557).stream_url(&server), "rtsp://relay.example.com:557");
    }

    #[test]
    fn test_generated_ids_are_section_safe() {
        let id = EndpointSpec::generate_id();
        assert!(id.starts_with("endpoint_"));
        assert!(EndpointSpec::new(id, "10.0.0.2", 554, 600).validate().is_ok());
    }

    #[test]
    fn test_availability_distinguishes_simulation() {
        let mut runtime = TunnelRuntimeState {
            state: SupervisorState::Running,
            active_strategy: Some(LaunchMethod::Simulation),
            ..Default::default()
        };
        assert_eq!(TunnelStatus::from(&runtime).availability(), TunnelAvailability::Simulated);

        runtime.active_strategy = Some(LaunchMethod::Real(StrategyKind::DirectExec));
        assert_eq!(TunnelStatus::from(&runtime).availability(), TunnelAvailability::Active);

        runtime.state = SupervisorState::Stopped;
        assert_eq!(TunnelStatus::from(&runtime).availability(), TunnelAvailability::Stopped);
    }
}
