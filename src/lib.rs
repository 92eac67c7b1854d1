// src/lib.rs
// Module declarations
pub mod diagnostics;
pub mod error;
pub mod frp;
pub mod logging;
pub mod process;
pub mod settings;
pub mod state;
pub mod utils;

pub use diagnostics::{DiagnosticsReport, HealthStatus};
pub use error::{ConfigError, InstallError, TunnelError, TunnelResult};
pub use frp::{EndpointSpec, StartReport, TunnelServerConfig, TunnelStatus, TunnelSupervisor};
pub use process::{LaunchMethod, StrategyKind, SupervisorState};
pub use settings::Settings;
pub use state::EndpointRegistry;
