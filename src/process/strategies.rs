// src/process/strategies.rs
// The individual ways of getting the agent running

use futures_util::future::BoxFuture;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use super::native::NativeEntryPoint;
use super::types::{LaunchContext, StrategyKind};
use crate::frp::installer::mirror_file;
use crate::settings::LauncherSpec;
use crate::utils::command::{chmod_external, exec_script, resolve_program, set_executable_mode};

const EARLY_EXIT_OUTPUT_LINES: usize = 20;
const EARLY_EXIT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// What a successful attempt leaves behind.
pub enum Launched {
    Child(Child),
    Native {
        handle: i32,
        entry: Arc<dyn NativeEntryPoint>,
    },
    Simulation,
}

impl Launched {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Launched::Child(child) => child.id(),
            Launched::Native { handle, .. } => u32::try_from(*handle).ok(),
            Launched::Simulation => None,
        }
    }
}

impl fmt::Debug for Launched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Launched::Child(child) => f.debug_tuple("Child").field(&child.id()).finish(),
            Launched::Native { handle, .. } => f.debug_struct("Native").field("handle", handle).finish(),
            Launched::Simulation => f.write_str("Simulation"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("exited within grace window (code {code:?}): {output}")]
    ExitedEarly { code: Option<i32>, output: String },

    #[error("native entry point returned {0}")]
    NativeFailure(i32),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,
}

/// One way of launching the agent. Implementations must not block the runtime.
pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Cheap pre-check; unavailable strategies are skipped without an attempt.
    fn is_available(&self, _ctx: &LaunchContext) -> bool {
        true
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>>;
}

/// Spawn `command` and hold it through the grace window. Exiting inside the
/// window is a failure; a stop request kills the child.
pub async fn spawn_with_grace(mut command: Command, ctx: &LaunchContext) -> Result<Launched, StrategyError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    log::debug!("Spawned candidate agent process {:?}", child.id());

    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            let output = collect_output(&mut child).await;
            Err(StrategyError::ExitedEarly { code, output })
        }
        _ = tokio::time::sleep(ctx.grace_window) => Ok(Launched::Child(child)),
        _ = ctx.cancelled() => {
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill cancelled candidate: {}", e);
            }
            Err(StrategyError::Cancelled)
        }
    }
}

// Last lines the child printed before it died
async fn collect_output(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = tokio::time::timeout(EARLY_EXIT_READ_TIMEOUT, stdout.read_to_string(&mut text)).await;
    }
    if let Some(mut stderr) = child.stderr.take() {
        let mut err = String::new();
        let _ = tokio::time::timeout(EARLY_EXIT_READ_TIMEOUT, stderr.read_to_string(&mut err)).await;
        text.push_str(&err);
    }

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(EARLY_EXIT_OUTPUT_LINES);
    lines[start..].join(" | ")
}

/// Try each candidate command until one survives the grace window.
async fn first_surviving(
    candidates: Vec<(String, Command)>,
    ctx: &LaunchContext,
) -> Result<Launched, StrategyError> {
    let mut failures = Vec::new();
    for (label, command) in candidates {
        match spawn_with_grace(command, ctx).await {
            Ok(launched) => {
                log::info!("Agent started via {}", label);
                return Ok(launched);
            }
            Err(StrategyError::Cancelled) => return Err(StrategyError::Cancelled),
            Err(e) => {
                log::warn!("Candidate {} failed: {}", label, e);
                failures.push(format!("{}: {}", label, e));
            }
        }
    }

    if failures.is_empty() {
        Err(StrategyError::Unavailable("no usable candidates".to_string()))
    } else {
        Err(StrategyError::ExitedEarly {
            code: None,
            output: failures.join("; "),
        })
    }
}

fn shell_command(shell: &Path, ctx: &LaunchContext) -> Command {
    let mut command = Command::new(shell);
    command.arg("-c").arg(exec_script(&ctx.binary_path, &ctx.config_path));
    if let Some(dir) = ctx.working_dir() {
        command.current_dir(dir);
    }
    command
}

/// Calls a compiled-in entry point. Used for both the primary and secondary native slots.
pub struct NativeStrategy {
    kind: StrategyKind,
    entry: Option<Arc<dyn NativeEntryPoint>>,
}

impl NativeStrategy {
    pub fn primary(entry: Option<Arc<dyn NativeEntryPoint>>) -> Self {
        Self {
            kind: StrategyKind::NativeLibrary,
            entry,
        }
    }

    pub fn secondary(entry: Option<Arc<dyn NativeEntryPoint>>) -> Self {
        Self {
            kind: StrategyKind::SecondaryNative,
            entry,
        }
    }

    async fn run(&self, ctx: &LaunchContext) -> Result<Launched, StrategyError> {
        let entry = self
            .entry
            .clone()
            .ok_or_else(|| StrategyError::Unavailable("no native entry point".to_string()))?;

        let binary = ctx.binary_path.clone();
        let config = ctx.config_path.clone();
        let start_entry = entry.clone();
        let handle = tokio::task::spawn_blocking(move || start_entry.start(&binary, &config))
            .await
            .map_err(|e| StrategyError::Panicked(e.to_string()))?;

        if handle <= 0 {
            return Err(StrategyError::NativeFailure(handle));
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.grace_window) => {}
            _ = ctx.cancelled() => {
                let stop_entry = entry.clone();
                let _ = tokio::task::spawn_blocking(move || stop_entry.stop(handle)).await;
                return Err(StrategyError::Cancelled);
            }
        }

        if entry.is_running(handle) {
            Ok(Launched::Native { handle, entry })
        } else {
            Err(StrategyError::ExitedEarly {
                code: None,
                output: format!("native handle {} exited within grace window", handle),
            })
        }
    }
}

impl ExecutionStrategy for NativeStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn is_available(&self, _ctx: &LaunchContext) -> bool {
        self.entry.is_some()
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        Box::pin(self.run(ctx))
    }
}

/// `<binary> -c <config>`, run from the binary's directory.
pub struct DirectExecStrategy;

impl ExecutionStrategy for DirectExecStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectExec
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        Box::pin(async move {
            let mut command = Command::new(&ctx.binary_path);
            command.arg("-c").arg(&ctx.config_path);
            if let Some(dir) = ctx.working_dir() {
                command.current_dir(dir);
            }
            spawn_with_grace(command, ctx).await
        })
    }
}

/// `<shell> -c "exec <binary> -c <config>"`.
pub struct ShellExecStrategy {
    shell: PathBuf,
}

impl ShellExecStrategy {
    pub fn new(shell: PathBuf) -> Self {
        Self { shell }
    }
}

impl ExecutionStrategy for ShellExecStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ShellExec
    }

    fn is_available(&self, _ctx: &LaunchContext) -> bool {
        self.shell.exists() || resolve_program(&self.shell.to_string_lossy()).is_some()
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        Box::pin(spawn_with_grace(shell_command(&self.shell, ctx), ctx))
    }
}

/// Copy binary and config into the mirror directory and exec from there.
pub struct MirrorDirExecStrategy;

impl MirrorDirExecStrategy {
    async fn run(&self, ctx: &LaunchContext) -> Result<Launched, StrategyError> {
        let mirror_dir = ctx
            .mirror_dir
            .clone()
            .ok_or_else(|| StrategyError::Unavailable("no mirror directory".to_string()))?;

        let binary = ctx.binary_path.clone();
        let config = ctx.config_path.clone();
        let dir = mirror_dir.clone();
        let (mirrored_binary, mirrored_config) = tokio::task::spawn_blocking(move || {
            let mirrored_binary = mirror_file(&binary, &dir)?;
            let mirrored_config = mirror_file(&config, &dir)?;
            set_executable_mode(&mirrored_binary)?;
            if let Err(e) = chmod_external(&mirrored_binary) {
                log::warn!("chmod of mirrored agent failed: {}", e);
            }
            Ok::<_, std::io::Error>((mirrored_binary, mirrored_config))
        })
        .await
        .map_err(|e| StrategyError::Panicked(e.to_string()))??;

        let mut command = Command::new(&mirrored_binary);
        command.arg("-c").arg(&mirrored_config).current_dir(&mirror_dir);
        spawn_with_grace(command, ctx).await
    }
}

impl ExecutionStrategy for MirrorDirExecStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MirrorDirExec
    }

    fn is_available(&self, ctx: &LaunchContext) -> bool {
        ctx.mirror_dir.is_some()
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        Box::pin(self.run(ctx))
    }
}

/// Same as shell exec, through each configured alternate shell in order.
pub struct AlternateShellStrategy {
    shells: Vec<PathBuf>,
}

impl AlternateShellStrategy {
    pub fn new(shells: Vec<PathBuf>) -> Self {
        Self { shells }
    }

    fn present_shells(&self) -> impl Iterator<Item = &PathBuf> {
        self.shells.iter().filter(|shell| shell.exists())
    }
}

impl ExecutionStrategy for AlternateShellStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AlternateShell
    }

    fn is_available(&self, _ctx: &LaunchContext) -> bool {
        self.present_shells().next().is_some()
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        let candidates = self
            .present_shells()
            .map(|shell| (shell.display().to_string(), shell_command(shell, ctx)))
            .collect();
        Box::pin(first_surviving(candidates, ctx))
    }
}

/// Run the shell/binary pair through a launcher utility such as `setsid`.
pub struct LauncherExecStrategy {
    launchers: Vec<LauncherSpec>,
    shell: PathBuf,
}

impl LauncherExecStrategy {
    pub fn new(launchers: Vec<LauncherSpec>, shell: PathBuf) -> Self {
        Self { launchers, shell }
    }

    fn resolved(&self) -> Vec<(PathBuf, &LauncherSpec)> {
        self.launchers
            .iter()
            .filter_map(|spec| resolve_program(&spec.program).map(|path| (path, spec)))
            .collect()
    }
}

impl ExecutionStrategy for LauncherExecStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LauncherExec
    }

    fn is_available(&self, _ctx: &LaunchContext) -> bool {
        !self.resolved().is_empty()
    }

    fn attempt<'a>(&'a self, ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        let script = exec_script(&ctx.binary_path, &ctx.config_path);
        let candidates = self
            .resolved()
            .into_iter()
            .map(|(program, spec)| {
                let mut command = Command::new(&program);
                command.args(&spec.args).arg(&self.shell).arg("-c").arg(&script);
                if let Some(dir) = ctx.working_dir() {
                    command.current_dir(dir);
                }
                (spec.program.clone(), command)
            })
            .collect();
        Box::pin(first_surviving(candidates, ctx))
    }
}

/// Terminal fallback. Never fails and never tunnels anything.
pub struct SimulationStrategy;

impl ExecutionStrategy for SimulationStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Simulation
    }

    fn attempt<'a>(&'a self, _ctx: &'a LaunchContext) -> BoxFuture<'a, Result<Launched, StrategyError>> {
        log::warn!("All real strategies failed, entering simulation mode: no real tunneling");
        Box::pin(async { Ok(Launched::Simulation) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::native::MockNativeEntryPoint;
    use tokio::sync::watch;

    fn context(dir: &Path, grace_ms: u64) -> (watch::Sender<bool>, LaunchContext) {
        let (tx, rx) = watch::channel(false);
        let ctx = LaunchContext {
            binary_path: dir.join("frpc"),
            config_path: dir.join("frpc.ini"),
            mirror_dir: None,
            grace_window: Duration::from_millis(grace_ms),
            cancel: rx,
        };
        (tx, ctx)
    }

    #[cfg(unix)]
    fn write_agent(dir: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("frpc");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.join("frpc.ini"), "[common]\n").unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_direct_exec_survives_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "echo \"[I] login to server success\"\nexec sleep 30");
        let (_tx, ctx) = context(dir.path(), 200);

        let launched = DirectExecStrategy.attempt(&ctx).await.unwrap();
        assert!(launched.pid().is_some());
        if let Launched::Child(mut child) = launched {
            child.kill().await.unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_failure_with_output() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "echo \"[E] login to server failed\"\nexit 1");
        let (_tx, ctx) = context(dir.path(), 2000);

        let err = DirectExecStrategy.attempt(&ctx).await.unwrap_err();
        match err {
            StrategyError::ExitedEarly { code, output } => {
                assert_eq!(code, Some(1));
                assert!(output.contains("login to server failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_exec_runs_agent() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "exec sleep 30");
        let (_tx, ctx) = context(dir.path(), 200);

        let strategy = ShellExecStrategy::new(PathBuf::from("/bin/sh"));
        assert!(strategy.is_available(&ctx));
        let launched = strategy.attempt(&ctx).await.unwrap();
        if let Launched::Child(mut child) = launched {
            child.kill().await.unwrap();
        } else {
            panic!("expected a child process");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mirror_dir_exec_copies_files() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "exec sleep 30");
        let mirror = dir.path().join("mirror");
        let (_tx, mut ctx) = context(dir.path(), 200);
        ctx.mirror_dir = Some(mirror.clone());

        let launched = MirrorDirExecStrategy.attempt(&ctx).await.unwrap();
        assert!(mirror.join("frpc").exists());
        assert!(mirror.join("frpc.ini").exists());
        if let Launched::Child(mut child) = launched {
            child.kill().await.unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_interrupts_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "exec sleep 30");
        let (tx, ctx) = context(dir.path(), 10_000);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
            tx
        });

        let started = std::time::Instant::now();
        let err = DirectExecStrategy.attempt(&ctx).await.unwrap_err();
        assert!(matches!(err, StrategyError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        let _tx = cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, ctx) = context(dir.path(), 100);

        let err = DirectExecStrategy.attempt(&ctx).await.unwrap_err();
        assert!(matches!(err, StrategyError::Spawn(_)));
    }

    #[test]
    fn test_alternate_shells_skip_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, ctx) = context(dir.path(), 100);

        let strategy = AlternateShellStrategy::new(vec![PathBuf::from("/no/such/shell")]);
        assert!(!strategy.is_available(&ctx));

        let launcher = LauncherExecStrategy::new(
            vec![LauncherSpec {
                program: "definitely-not-a-launcher".to_string(),
                args: vec![],
            }],
            PathBuf::from("/bin/sh"),
        );
        assert!(!launcher.is_available(&ctx));
    }

    #[tokio::test]
    async fn test_native_strategy_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, ctx) = context(dir.path(), 50);

        let mut failing = MockNativeEntryPoint::new();
        failing.expect_start().returning(|_, _| -2);
        let strategy = NativeStrategy::primary(Some(Arc::new(failing)));
        let err = strategy.attempt(&ctx).await.unwrap_err();
        assert!(matches!(err, StrategyError::NativeFailure(-2)));

        let mut healthy = MockNativeEntryPoint::new();
        healthy.expect_start().returning(|_, _| 77);
        healthy.expect_is_running().returning(|_| true);
        let strategy = NativeStrategy::secondary(Some(Arc::new(healthy)));
        assert_eq!(strategy.kind(), StrategyKind::SecondaryNative);
        let launched = strategy.attempt(&ctx).await.unwrap();
        assert_eq!(launched.pid(), Some(77));

        let mut crashed = MockNativeEntryPoint::new();
        crashed.expect_start().returning(|_, _| 78);
        crashed.expect_is_running().returning(|_| false);
        let strategy = NativeStrategy::primary(Some(Arc::new(crashed)));
        assert!(matches!(
            strategy.attempt(&ctx).await.unwrap_err(),
            StrategyError::ExitedEarly { .. }
        ));

        assert!(!NativeStrategy::primary(None).is_available(&ctx));
    }

    #[tokio::test]
    async fn test_simulation_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, ctx) = context(dir.path(), 100);
        assert!(matches!(SimulationStrategy.attempt(&ctx).await, Ok(Launched::Simulation)));
    }
}
