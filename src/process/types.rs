use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

// One concrete way of getting the agent running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    NativeLibrary,
    DirectExec,
    ShellExec,
    MirrorDirExec,
    AlternateShell,
    LauncherExec,
    SecondaryNative,
    Simulation,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::NativeLibrary => "native_library",
            StrategyKind::DirectExec => "direct_exec",
            StrategyKind::ShellExec => "shell_exec",
            StrategyKind::MirrorDirExec => "mirror_dir_exec",
            StrategyKind::AlternateShell => "alternate_shell",
            StrategyKind::LauncherExec => "launcher_exec",
            StrategyKind::SecondaryNative => "secondary_native",
            StrategyKind::Simulation => "simulation",
        }
    }

    pub fn parse(value: &str) -> Option<StrategyKind> {
        let all = [
            StrategyKind::NativeLibrary,
            StrategyKind::DirectExec,
            StrategyKind::ShellExec,
            StrategyKind::MirrorDirExec,
            StrategyKind::AlternateShell,
            StrategyKind::LauncherExec,
            StrategyKind::SecondaryNative,
            StrategyKind::Simulation,
        ];
        all.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the tunnel is being kept up. A simulated tunnel is never a `Real` one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LaunchMethod {
    Real(StrategyKind),
    Simulation,
}

impl LaunchMethod {
    pub fn from_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Simulation => LaunchMethod::Simulation,
            other => LaunchMethod::Real(other),
        }
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self, LaunchMethod::Simulation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMethod::Real(kind) => kind.as_str(),
            LaunchMethod::Simulation => StrategyKind::Simulation.as_str(),
        }
    }
}

impl fmt::Display for LaunchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LaunchMethod> for String {
    fn from(method: LaunchMethod) -> Self {
        method.as_str().to_string()
    }
}

impl TryFrom<String> for LaunchMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StrategyKind::parse(&value)
            .map(LaunchMethod::from_kind)
            .ok_or_else(|| format!("unknown launch method: {}", value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure(String),
}

/// One strategy tried during a single start; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
    pub pid: Option<u32>,
}

impl ExecutionAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

// Stopped -> Starting -> Running -> Stopping -> Stopped
// Running -> Restarting -> Running | Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Restarting => write!(f, "restarting"),
            SupervisorState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Everything a strategy needs to launch the agent once.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub mirror_dir: Option<PathBuf>,
    pub grace_window: Duration,
    pub cancel: watch::Receiver<bool>,
}

impl LaunchContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        let sender_dropped = cancel.wait_for(|requested| *requested).await.is_err();
        if sender_dropped {
            // Sender gone: nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.binary_path.parent().map(|p| p.to_path_buf())
    }
}
