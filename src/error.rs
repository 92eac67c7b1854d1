// src/error.rs
// Error taxonomy surfaced by the supervisor facade

use crate::process::types::ExecutionAttempt;
use std::path::PathBuf;

/// The agent binary could not be placed or made executable.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to read bundled agent for {arch}: {source}")]
    SourceUnreadable {
        arch: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write agent binary to {path:?}: {source}")]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The agent configuration could not be produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing server config")]
    MissingServerConfig,

    #[error("no enabled endpoints")]
    NoEnabledEndpoints,

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to write config: {0}")]
    Write(String),
}

/// Top-level error returned by `TunnelSupervisor`.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Tunnel agent is already running")]
    AlreadyRunning,

    #[error("All {} execution strategies failed", attempts.len())]
    AllStrategiesExhausted { attempts: Vec<ExecutionAttempt> },

    #[error("Start was cancelled by a stop request")]
    Cancelled,

    #[error("Failed to stop tunnel agent: {0}")]
    Stop(String),
}

impl TunnelError {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::Install(_) => "INSTALL_ERROR",
            TunnelError::Config(_) => "CONFIG_ERROR",
            TunnelError::AlreadyRunning => "ALREADY_RUNNING",
            TunnelError::AllStrategiesExhausted { .. } => "START_FAILED",
            TunnelError::Cancelled => "CANCELLED",
            TunnelError::Stop(_) => "STOP_ERROR",
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages_match_user_text() {
        assert_eq!(ConfigError::MissingServerConfig.to_string(), "missing server config");
        assert_eq!(ConfigError::NoEnabledEndpoints.to_string(), "no enabled endpoints");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TunnelError::AlreadyRunning.code(), "ALREADY_RUNNING");
        let err: TunnelError = ConfigError::NoEnabledEndpoints.into();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert_eq!(err.to_string(), "no enabled endpoints");
    }
}
