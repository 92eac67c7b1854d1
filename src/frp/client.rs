use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

use super::config::FRPConfigGenerator;
use super::events::{EventHub, ExitEvent, LogEvent, Subscription};
use super::installer::{ArtifactStore, BinaryInstaller, DirectoryArtifactStore, InstalledBinary};
use super::process::{kill_strays, AgentProcess};
use super::types::{
    EndpointSpec, GeneratedConfigArtifact, TunnelRuntimeState, TunnelServerConfig, TunnelStatus,
};
use crate::diagnostics::{self, DiagnosticsInput, DiagnosticsReport};
use crate::error::{ConfigError, TunnelError, TunnelResult};
use crate::logging::RECENT_LOG_CAPACITY;
use crate::process::chain::{ChainError, ChainOutcome, StrategyChain};
use crate::process::monitor::{self, ExitInfo, MonitorTimings};
use crate::process::native::NativeEntryPoint;
use crate::process::types::{ExecutionAttempt, LaunchContext, LaunchMethod, SupervisorState};
use crate::settings::Settings;
use crate::state::store::{EndpointRegistry, TunnelStatusRecord};

/// Result of a successful `start`, including every strategy that was tried.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub method: LaunchMethod,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub attempts: Vec<ExecutionAttempt>,
}

struct Inner {
    settings: Settings,
    installer: BinaryInstaller,
    generator: FRPConfigGenerator,
    chain: StrategyChain,
    events: Arc<EventHub>,
    // Serializes start, stop, install and restarts
    op_lock: tokio::sync::Mutex<()>,
    runtime: Mutex<TunnelRuntimeState>,
    active: Mutex<Option<AgentProcess>>,
    cancel: watch::Sender<bool>,
    target: Mutex<(Option<TunnelServerConfig>, Vec<EndpointSpec>)>,
}

/// Single entry point for starting, stopping and inspecting the tunnel agent.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

pub struct TunnelSupervisorBuilder {
    settings: Settings,
    artifact_store: Option<Arc<dyn ArtifactStore>>,
    natives: Option<(Option<Arc<dyn NativeEntryPoint>>, Option<Arc<dyn NativeEntryPoint>>)>,
    chain: Option<StrategyChain>,
    arch_override: Option<String>,
}

impl TunnelSupervisorBuilder {
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }

    pub fn native_entry_points(
        mut self,
        primary: Option<Arc<dyn NativeEntryPoint>>,
        secondary: Option<Arc<dyn NativeEntryPoint>>,
    ) -> Self {
        self.natives = Some((primary, secondary));
        self
    }

    /// Replace the standard eight-step chain.
    pub fn chain(mut self, chain: StrategyChain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn arch_override(mut self, abi: impl Into<String>) -> Self {
        self.arch_override = Some(abi.into());
        self
    }

    pub fn build(self) -> TunnelSupervisor {
        let settings = self.settings;

        let store = self.artifact_store.unwrap_or_else(|| {
            Arc::new(DirectoryArtifactStore::new(settings.artifact_dir.clone(), settings.binary_name.clone()))
        });
        let mut installer = BinaryInstaller::new(store, settings.binary_name.clone(), settings.mirror_dir.clone());
        if let Some(abi) = self.arch_override {
            installer = installer.with_arch_override(abi);
        }

        let chain = match self.chain {
            Some(chain) => chain,
            None => {
                let (primary, secondary) = self.natives.unwrap_or_else(default_native_entry_points);
                StrategyChain::standard(&settings, primary, secondary)
            }
        };

        let generator = FRPConfigGenerator::new(
            settings.data_dir.clone(),
            settings.config_file_name.clone(),
            settings.tunnel_mode,
        );
        let (cancel, _) = watch::channel(false);

        TunnelSupervisor {
            inner: Arc::new(Inner {
                settings,
                installer,
                generator,
                chain,
                events: EventHub::new(),
                op_lock: tokio::sync::Mutex::new(()),
                runtime: Mutex::new(TunnelRuntimeState::default()),
                active: Mutex::new(None),
                cancel,
                target: Mutex::new((None, Vec::new())),
            }),
        }
    }
}

#[cfg(unix)]
fn default_native_entry_points() -> (Option<Arc<dyn NativeEntryPoint>>, Option<Arc<dyn NativeEntryPoint>>) {
    use crate::process::native::ForkExecEntryPoint;
    (
        Some(Arc::new(ForkExecEntryPoint::primary())),
        Some(Arc::new(ForkExecEntryPoint::secondary())),
    )
}

#[cfg(not(unix))]
fn default_native_entry_points() -> (Option<Arc<dyn NativeEntryPoint>>, Option<Arc<dyn NativeEntryPoint>>) {
    (None, None)
}

impl TunnelSupervisor {
    pub fn builder(settings: Settings) -> TunnelSupervisorBuilder {
        TunnelSupervisorBuilder {
            settings,
            artifact_store: None,
            natives: None,
            chain: None,
            arch_override: None,
        }
    }

    pub fn new(settings: Settings) -> Self {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Build the config, install the agent if needed and walk the strategy chain.
    pub async fn start(
        &self,
        server: Option<&TunnelServerConfig>,
        endpoints: &[EndpointSpec],
    ) -> TunnelResult<StartReport> {
        if self.inner.runtime.lock().state != SupervisorState::Stopped {
            return Err(TunnelError::AlreadyRunning);
        }

        let _guard = self.inner.op_lock.lock().await;
        {
            let mut runtime = self.inner.runtime.lock();
            if runtime.state != SupervisorState::Stopped {
                return Err(TunnelError::AlreadyRunning);
            }
            runtime.state = SupervisorState::Starting;
            runtime.restart_count = 0;
            runtime.same_strategy_restarts = 0;
            self.inner.cancel.send_replace(false);
        }

        log::info!("Starting tunnel agent with {} endpoint(s)", endpoints.len());
        match self.inner.launch(server, endpoints).await {
            Ok(report) => Ok(report),
            Err(e) => {
                log::error!("Tunnel start failed: {}", e);
                self.inner.mark_stopped();
                Err(e)
            }
        }
    }

    /// Terminate the active agent. Succeeds immediately when already stopped.
    pub async fn stop(&self) -> TunnelResult<()> {
        {
            let runtime = self.inner.runtime.lock();
            if runtime.state == SupervisorState::Stopped {
                return Ok(());
            }
            // Interrupts a start or restart that is mid grace window or backoff
            self.inner.cancel.send_replace(true);
        }

        let _guard = self.inner.op_lock.lock().await;
        {
            let mut runtime = self.inner.runtime.lock();
            if runtime.state == SupervisorState::Stopped {
                return Ok(());
            }
            runtime.state = SupervisorState::Stopping;
        }

        let agent = self.inner.active.lock().take();
        let stop_result = match agent {
            Some(agent) => agent.stop(self.inner.settings.stop_timeout()).await,
            None => Ok(None),
        };

        let mut stray_paths = vec![self.inner.settings.binary_path()];
        stray_paths.extend(self.inner.settings.mirror_binary_path());
        match tokio::task::spawn_blocking(move || kill_strays(&stray_paths)).await {
            Ok(0) => {}
            Ok(killed) => log::info!("Cleaned up {} stray agent process(es)", killed),
            Err(e) => log::warn!("Stray cleanup failed: {}", e),
        }

        self.inner.mark_stopped();

        match stop_result {
            Ok(code) => {
                log::info!("Tunnel stopped (agent exit code {:?})", code);
                Ok(())
            }
            Err(e) => {
                log::error!("Agent did not stop cleanly: {}", e);
                Err(TunnelError::Stop(e))
            }
        }
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::from(&*self.inner.runtime.lock())
    }

    pub fn on_log(&self, callback: impl Fn(&LogEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.on_log(callback)
    }

    pub fn on_exit(&self, callback: impl Fn(&ExitEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.on_exit(callback)
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<String> {
        self.inner.events.recent_logs(limit)
    }

    /// Render the config without writing it.
    pub fn render_config(
        &self,
        server: Option<&TunnelServerConfig>,
        endpoints: &[EndpointSpec],
    ) -> Result<GeneratedConfigArtifact, ConfigError> {
        self.inner.generator.build(server, endpoints)
    }

    pub async fn install(&self) -> TunnelResult<InstalledBinary> {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.install().await
    }

    /// Diagnostics for the server and endpoints of the last start.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let (server, endpoints) = self.inner.target.lock().clone();
        self.diagnostics_for(server, endpoints).await
    }

    pub async fn diagnostics_for(
        &self,
        server: Option<TunnelServerConfig>,
        endpoints: Vec<EndpointSpec>,
    ) -> DiagnosticsReport {
        diagnostics::collect(DiagnosticsInput {
            settings: self.inner.settings.clone(),
            architecture: self.inner.installer.architecture(),
            server,
            endpoints,
            tunnel: self.status(),
            recent_logs: self.recent_logs(RECENT_LOG_CAPACITY),
        })
        .await
    }

    /// Start with the persisted server config and enabled endpoints, then record the outcome.
    pub async fn start_from_store(&self, registry: &EndpointRegistry) -> TunnelResult<StartReport> {
        let server = registry
            .server_config()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .ok_or(ConfigError::MissingServerConfig)?;
        let endpoints = registry
            .enabled_endpoints()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let report = self.start(Some(&server), &endpoints).await?;
        let record = TunnelStatusRecord {
            is_active: true,
            started_at: Some(report.started_at),
            stopped_at: None,
            method: Some(report.method),
        };
        if let Err(e) = registry.record_status(record) {
            log::warn!("Failed to record tunnel status: {}", e);
        }
        Ok(report)
    }

    pub async fn stop_with_store(&self, registry: &EndpointRegistry) -> TunnelResult<()> {
        let previous = self.status();
        let result = self.stop().await;
        let record = TunnelStatusRecord {
            is_active: false,
            started_at: previous.started_at,
            stopped_at: Some(Utc::now()),
            method: previous.method,
        };
        if let Err(e) = registry.record_status(record) {
            log::warn!("Failed to record tunnel status: {}", e);
        }
        result
    }
}

enum ExitAction {
    Ignore,
    GiveUp(String),
    Restart { attempt: u32 },
}

impl Inner {
    fn timings(&self) -> MonitorTimings {
        MonitorTimings {
            native_poll_interval: self.settings.native_poll_interval(),
            simulation_interval: self.settings.simulation_interval(),
        }
    }

    fn launch_context(&self, binary_path: PathBuf) -> LaunchContext {
        LaunchContext {
            binary_path,
            config_path: self.generator.get_config_path(),
            mirror_dir: self.settings.mirror_dir.clone(),
            grace_window: self.settings.grace_window(),
            cancel: self.cancel.subscribe(),
        }
    }

    fn mark_stopped(&self) {
        {
            let mut runtime = self.runtime.lock();
            runtime.state = SupervisorState::Stopped;
            runtime.clear_run();
        }
        self.active.lock().take();
    }

    async fn install(self: &Arc<Self>) -> TunnelResult<InstalledBinary> {
        let inner = self.clone();
        let task = tokio::task::spawn_blocking(move || inner.installer.ensure_installed(&inner.settings.data_dir));
        match task.await {
            Ok(result) => Ok(result?),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    async fn launch(
        self: &Arc<Self>,
        server: Option<&TunnelServerConfig>,
        endpoints: &[EndpointSpec],
    ) -> TunnelResult<StartReport> {
        let artifact = self.generator.build(server, endpoints)?;
        self.generator.write(&artifact)?;
        *self.target.lock() = (server.cloned(), endpoints.to_vec());

        let installed = self.install().await?;
        let ctx = self.launch_context(installed.path);

        let outcome = self.chain.run_from(0, &ctx).await.map_err(|e| match e {
            ChainError::Cancelled { .. } => TunnelError::Cancelled,
            ChainError::Exhausted { attempts } => {
                log::error!("No execution strategy could start the agent, not even simulation");
                TunnelError::AllStrategiesExhausted { attempts }
            }
        })?;

        let attempts = outcome.attempts.clone();
        let agent = self.install_run(outcome);
        if agent.method.is_simulation() {
            log::warn!("Tunnel is SIMULATED: the UI shows running but nothing is tunneled");
        } else {
            log::info!("Tunnel agent running via {}", agent.method);
        }

        Ok(StartReport {
            method: agent.method,
            pid: agent.pid,
            started_at: agent.started_at,
            attempts,
        })
    }

    /// Attach the monitor to a fresh launch, publish it as the active run and watch for its exit.
    fn install_run(self: &Arc<Self>, outcome: ChainOutcome) -> RunSummary {
        let method = LaunchMethod::from_kind(outcome.kind);
        let handle = monitor::attach(outcome.launched, method, self.events.clone(), self.timings());
        let agent = AgentProcess::new(handle, outcome.index);

        let summary = RunSummary {
            method,
            pid: agent.pid(),
            started_at: agent.started_at,
        };
        let run_id = agent.run_id;
        let exit_watch = agent.exit_watch();

        {
            let mut runtime = self.runtime.lock();
            runtime.state = SupervisorState::Running;
            runtime.active_strategy = Some(method);
            runtime.pid = summary.pid;
            runtime.started_at = Some(summary.started_at);
            runtime.run_id = Some(run_id);
            runtime.strategy_index = Some(outcome.index);
        }
        *self.active.lock() = Some(agent);

        spawn_watchdog(Arc::downgrade(self), run_id, exit_watch);
        summary
    }

    fn decide_exit(&self, run_id: Uuid, code: Option<i32>) -> ExitAction {
        let policy = &self.settings.restart;
        let mut runtime = self.runtime.lock();
        if runtime.run_id != Some(run_id) || runtime.state != SupervisorState::Running {
            return ExitAction::Ignore;
        }

        if code == Some(0) {
            log::info!("Agent exited cleanly, tunnel stopped");
            runtime.state = SupervisorState::Stopped;
            runtime.clear_run();
            return ExitAction::Ignore;
        }

        if runtime.restart_count >= policy.max_restarts {
            runtime.state = SupervisorState::Stopped;
            runtime.clear_run();
            return ExitAction::GiveUp(format!(
                "agent exited unexpectedly (code {:?}) after {} restarts, giving up",
                code, runtime.restart_count
            ));
        }

        runtime.restart_count += 1;
        runtime.state = SupervisorState::Restarting;
        ExitAction::Restart {
            attempt: runtime.restart_count,
        }
    }

    async fn handle_exit(self: Arc<Self>, run_id: Uuid, exit: Option<ExitInfo>) {
        let code = exit.and_then(|info| info.code);
        let method = self.runtime.lock().active_strategy.unwrap_or(LaunchMethod::Simulation);

        let attempt = match self.decide_exit(run_id, code) {
            ExitAction::Ignore => {
                self.clear_finished_run(run_id);
                return;
            }
            ExitAction::GiveUp(reason) => {
                log::error!("Tunnel agent {}", reason);
                self.events.emit_log(method, &format!("[E] supervisor: {}", reason));
                self.active.lock().take();
                return;
            }
            ExitAction::Restart { attempt } => attempt,
        };

        let backoff = self.settings.restart.backoff_for(attempt);
        log::warn!(
            "Agent ({}) exited unexpectedly with code {:?}, restart {}/{} in {:?}",
            method,
            code,
            attempt,
            self.settings.restart.max_restarts,
            backoff
        );

        let mut cancel = self.cancel.subscribe();
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(backoff) => false,
            result = cancel.wait_for(|requested| *requested) => result.is_ok(),
        };
        if cancelled {
            log::info!("Restart abandoned, stop requested");
            return;
        }

        let _guard = self.op_lock.lock().await;
        let start_index = {
            let mut runtime = self.runtime.lock();
            if runtime.run_id != Some(run_id) || runtime.state != SupervisorState::Restarting || *self.cancel.borrow() {
                return;
            }

            let current = runtime.strategy_index.unwrap_or(0);
            let last = self.chain.len().saturating_sub(1);
            if runtime.same_strategy_restarts < self.settings.restart.same_strategy_retries {
                runtime.same_strategy_restarts += 1;
                current.min(last)
            } else {
                runtime.same_strategy_restarts = 0;
                (current + 1).min(last)
            }
        };

        let ctx = self.launch_context(self.settings.binary_path());
        match self.chain.run_from(start_index, &ctx).await {
            Ok(outcome) => {
                if outcome.index != start_index {
                    self.runtime.lock().same_strategy_restarts = 0;
                }
                let summary = self.install_run(outcome);
                log::info!("Tunnel agent restarted via {}", summary.method);
            }
            Err(ChainError::Cancelled { .. }) => {
                log::info!("Restart cancelled by stop request");
            }
            Err(ChainError::Exhausted { attempts }) => {
                let reason = format!("restart failed, {} strategies exhausted", attempts.len());
                log::error!("Tunnel agent {}", reason);
                self.events.emit_log(method, &format!("[E] supervisor: {}", reason));
                self.mark_stopped();
            }
        }
    }

    // Drop the finished agent once a clean exit has moved the supervisor to Stopped
    fn clear_finished_run(&self, run_id: Uuid) {
        let mut active = self.active.lock();
        if active.as_ref().map(|agent| agent.run_id) == Some(run_id) && self.runtime.lock().state == SupervisorState::Stopped {
            active.take();
        }
    }
}

struct RunSummary {
    method: LaunchMethod,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

fn spawn_watchdog(inner: Weak<Inner>, run_id: Uuid, mut exit_watch: watch::Receiver<Option<ExitInfo>>) {
    tokio::spawn(async move {
        let _ = exit_watch.wait_for(|exit| exit.is_some()).await;
        let exit = *exit_watch.borrow();

        // Supervisor dropped: nothing left to restart
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_exit(run_id, exit).await;
    });
}
