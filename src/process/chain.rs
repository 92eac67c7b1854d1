// src/process/chain.rs
// Ordered list of strategies, tried one after another until one holds

use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::native::NativeEntryPoint;
use super::strategies::{
    AlternateShellStrategy, DirectExecStrategy, ExecutionStrategy, LauncherExecStrategy, Launched,
    MirrorDirExecStrategy, NativeStrategy, ShellExecStrategy, SimulationStrategy, StrategyError,
};
use super::types::{AttemptOutcome, ExecutionAttempt, LaunchContext, StrategyKind};
use crate::settings::Settings;
use crate::utils::command::default_shell;

#[derive(Debug)]
pub struct ChainOutcome {
    pub index: usize,
    pub kind: StrategyKind,
    pub launched: Launched,
    pub attempts: Vec<ExecutionAttempt>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("start cancelled after {} attempts", attempts.len())]
    Cancelled { attempts: Vec<ExecutionAttempt> },

    #[error("all {} strategies failed", attempts.len())]
    Exhausted { attempts: Vec<ExecutionAttempt> },
}

pub struct StrategyChain {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
}

impl StrategyChain {
    /// Build a chain that always ends in simulation.
    pub fn new(mut strategies: Vec<Arc<dyn ExecutionStrategy>>) -> Self {
        let ends_in_simulation = strategies
            .last()
            .map(|s| s.kind() == StrategyKind::Simulation)
            .unwrap_or(false);
        if !ends_in_simulation {
            strategies.push(Arc::new(SimulationStrategy));
        }
        Self { strategies }
    }

    /// Build a chain exactly as given, without the simulation terminal.
    pub fn from_strategies(strategies: Vec<Arc<dyn ExecutionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Native, direct, shell, mirror, alternate shells, launchers, secondary native, simulation.
    pub fn standard(
        settings: &Settings,
        primary_native: Option<Arc<dyn NativeEntryPoint>>,
        secondary_native: Option<Arc<dyn NativeEntryPoint>>,
    ) -> Self {
        let shell = default_shell();
        Self::new(vec![
            Arc::new(NativeStrategy::primary(primary_native)),
            Arc::new(DirectExecStrategy),
            Arc::new(ShellExecStrategy::new(shell.clone())),
            Arc::new(MirrorDirExecStrategy),
            Arc::new(AlternateShellStrategy::new(settings.alternate_shells.clone())),
            Arc::new(LauncherExecStrategy::new(settings.launchers.clone(), shell)),
            Arc::new(NativeStrategy::secondary(secondary_native)),
            Arc::new(SimulationStrategy),
        ])
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Try strategies from `start_index` on. A panic or error in one strategy
    /// moves on to the next; only a stop request ends the walk early.
    pub async fn run_from(&self, start_index: usize, ctx: &LaunchContext) -> Result<ChainOutcome, ChainError> {
        let total = self.strategies.len();
        let mut attempts = Vec::new();

        for (index, strategy) in self.strategies.iter().enumerate().skip(start_index) {
            if ctx.is_cancelled() {
                log::info!("Start cancelled before strategy {}", strategy.kind());
                return Err(ChainError::Cancelled { attempts });
            }

            let kind = strategy.kind();
            if !strategy.is_available(ctx) {
                log::debug!("Strategy {} unavailable, skipping", kind);
                continue;
            }

            log::info!("Trying strategy {} ({}/{})", kind, index + 1, total);
            let result = match AssertUnwindSafe(async { strategy.attempt(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(StrategyError::Panicked(panic_message(panic.as_ref()))),
            };

            match result {
                Ok(launched) => {
                    let pid = launched.pid();
                    log::info!("Strategy {} succeeded (pid {:?})", kind, pid);
                    attempts.push(ExecutionAttempt {
                        strategy: kind,
                        outcome: AttemptOutcome::Success,
                        pid,
                    });
                    return Ok(ChainOutcome {
                        index,
                        kind,
                        launched,
                        attempts,
                    });
                }
                Err(StrategyError::Cancelled) => {
                    log::info!("Strategy {} interrupted by stop request", kind);
                    attempts.push(ExecutionAttempt {
                        strategy: kind,
                        outcome: AttemptOutcome::Failure(StrategyError::Cancelled.to_string()),
                        pid: None,
                    });
                    return Err(ChainError::Cancelled { attempts });
                }
                Err(e) => {
                    log::warn!("Strategy {} failed: {}", kind, e);
                    attempts.push(ExecutionAttempt {
                        strategy: kind,
                        outcome: AttemptOutcome::Failure(e.to_string()),
                        pid: None,
                    });
                }
            }
        }

        log::error!("All execution strategies exhausted ({} attempts)", attempts.len());
        Err(ChainError::Exhausted { attempts })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
