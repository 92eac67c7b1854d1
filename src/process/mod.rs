// src/process/mod.rs

pub mod chain;
pub mod monitor;
pub mod native;
pub mod strategies;
pub mod types;

pub use chain::StrategyChain;
pub use native::NativeEntryPoint;
pub use strategies::ExecutionStrategy;
pub use types::{ExecutionAttempt, LaunchMethod, StrategyKind, SupervisorState};
