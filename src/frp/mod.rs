pub mod client;
pub mod config;
pub mod events;
pub mod installer;
pub mod process;
pub mod types;

pub use client::{StartReport, TunnelSupervisor, TunnelSupervisorBuilder};
pub use config::FRPConfigGenerator;
pub use events::{EventHub, ExitEvent, LogEvent, Subscription};
pub use installer::{Architecture, ArtifactStore, BinaryInstaller, DirectoryArtifactStore, InstalledBinary};
pub use types::{EndpointSpec, TunnelMode, TunnelServerConfig, TunnelStatus};
