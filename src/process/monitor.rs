// src/process/monitor.rs
// Watches a launched agent: forwards its output, notices its exit, carries stop signals

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::native::NativeEntryPoint;
use super::strategies::Launched;
use super::types::LaunchMethod;
use crate::frp::events::EventHub;

pub const SIMULATION_BANNER: &str = "simulation mode: no real tunneling, the agent could not be started";
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGTERM for OS processes, the entry point's stop for native handles.
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorTimings {
    pub native_poll_interval: Duration,
    pub simulation_interval: Duration,
}

/// Live agent as seen through its monitor task. Dropping the handle stops the agent.
pub struct RunningHandle {
    pub pid: Option<u32>,
    pub method: LaunchMethod,
    control: mpsc::UnboundedSender<ControlSignal>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

impl RunningHandle {
    /// Returns false once the monitor has finished.
    pub fn signal(&self, signal: ControlSignal) -> bool {
        self.control.send(signal).is_ok()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exited.clone()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exited.borrow()
    }

    pub async fn wait_exit(&self) -> Option<ExitInfo> {
        let mut exited = self.exited.clone();
        // Err means the monitor is gone; whatever it last published stands
        let _ = exited.wait_for(|info| info.is_some()).await;
        let info = *exited.borrow();
        info
    }
}

/// Start watching `launched`. Must be called inside a tokio runtime.
pub fn attach(
    launched: Launched,
    method: LaunchMethod,
    events: Arc<EventHub>,
    timings: MonitorTimings,
) -> RunningHandle {
    let pid = launched.pid();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (exited_tx, exited_rx) = watch::channel(None);

    // The monitor task runs detached; its exit is observed through `exited`
    match launched {
        Launched::Child(child) => tokio::spawn(watch_child(child, method, events, control_rx, exited_tx)),
        Launched::Native { handle, entry } => tokio::spawn(watch_native(
            handle,
            entry,
            method,
            events,
            control_rx,
            exited_tx,
            timings.native_poll_interval,
        )),
        Launched::Simulation => tokio::spawn(run_simulation(events, control_rx, exited_tx, timings.simulation_interval)),
    };

    RunningHandle {
        pid,
        method,
        control: control_tx,
        exited: exited_rx,
    }
}

fn spawn_line_reader<R>(stream: R, method: LaunchMethod, events: Arc<EventHub>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => events.emit_log(method, &String::from_utf8_lossy(&buffer)),
                Err(e) => {
                    log::error!("Failed to read agent output: {}", e);
                    break;
                }
            }
        }
        log::debug!("Agent output reader ended ({})", method);
    })
}

fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => return,
                Err(e) => log::warn!("SIGTERM to agent {} failed: {}", pid, e),
            }
        }
    }

    force_kill(child);
}

fn force_kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("Failed to kill agent process: {}", e);
    }
}

async fn watch_child(
    mut child: Child,
    method: LaunchMethod,
    events: Arc<EventHub>,
    mut control: mpsc::UnboundedReceiver<ControlSignal>,
    exited: watch::Sender<Option<ExitInfo>>,
) {
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, method, events.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, method, events.clone()));
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = control.recv() => match signal {
                Some(ControlSignal::Terminate) => send_terminate(&mut child),
                Some(ControlSignal::Kill) => force_kill(&mut child),
                None => {
                    // Handle dropped without a stop
                    force_kill(&mut child);
                    break child.wait().await;
                }
            }
        }
    };

    for reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            log::debug!("Agent output reader still open after exit, detaching");
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::error!("Error waiting for agent process: {}", e);
            None
        }
    };

    events.emit_exit(method, code);
    exited.send_replace(Some(ExitInfo { code }));
}

async fn watch_native(
    handle: i32,
    entry: Arc<dyn NativeEntryPoint>,
    method: LaunchMethod,
    events: Arc<EventHub>,
    mut control: mpsc::UnboundedReceiver<ControlSignal>,
    exited: watch::Sender<Option<ExitInfo>>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !entry.is_running(handle) {
                    log::warn!("Native agent handle {} is no longer running", handle);
                    break;
                }
            }
            _ = control.recv() => {
                let stop_entry = entry.clone();
                match tokio::task::spawn_blocking(move || stop_entry.stop(handle)).await {
                    Ok(0) => {}
                    Ok(code) => log::warn!("Native stop for handle {} returned {}", handle, code),
                    Err(e) => log::error!("Native stop for handle {} panicked: {}", handle, e),
                }
                break;
            }
        }
    }

    // Native handles never report an exit code
    events.emit_exit(method, None);
    exited.send_replace(Some(ExitInfo { code: None }));
}

async fn run_simulation(
    events: Arc<EventHub>,
    mut control: mpsc::UnboundedReceiver<ControlSignal>,
    exited: watch::Sender<Option<ExitInfo>>,
    interval: Duration,
) {
    events.emit_log(LaunchMethod::Simulation, SIMULATION_BANNER);

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut beats: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                beats += 1;
                events.emit_log(
                    LaunchMethod::Simulation,
                    &format!("simulation mode: no real tunneling (heartbeat {})", beats),
                );
            }
            _ = control.recv() => break,
        }
    }

    events.emit_exit(LaunchMethod::Simulation, Some(0));
    exited.send_replace(Some(ExitInfo { code: Some(0) }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::native::MockNativeEntryPoint;
    use crate::process::types::StrategyKind;
    use parking_lot::Mutex;

    fn timings() -> MonitorTimings {
        MonitorTimings {
            native_poll_interval: Duration::from_millis(20),
            simulation_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_simulation_emits_labelled_logs_until_stopped() {
        let events = EventHub::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_cb = lines.clone();
        let _sub = events.on_log(move |event| lines_cb.lock().push(event.line.clone()));

        let handle = attach(Launched::Simulation, LaunchMethod::Simulation, events.clone(), timings());
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert!(handle.signal(ControlSignal::Terminate));

        let exit = tokio::time::timeout(Duration::from_secs(2), handle.wait_exit()).await.unwrap();
        assert_eq!(exit, Some(ExitInfo { code: Some(0) }));

        let lines = lines.lock();
        assert!(lines.len() >= 2);
        assert!(lines.iter().all(|l| l.contains("simulation")));
    }

    #[tokio::test]
    async fn test_native_handle_exit_is_detected() {
        let mut entry = MockNativeEntryPoint::new();
        let mut remaining = 2;
        entry.expect_is_running().returning(move |_| {
            remaining -= 1;
            remaining > 0
        });

        let events = EventHub::new();
        let handle = attach(
            Launched::Native {
                handle: 99,
                entry: Arc::new(entry),
            },
            LaunchMethod::Real(StrategyKind::NativeLibrary),
            events,
            timings(),
        );
        let exit = tokio::time::timeout(Duration::from_secs(2), handle.wait_exit()).await.unwrap();
        assert_eq!(exit, Some(ExitInfo { code: None }));
    }

    #[tokio::test]
    async fn test_native_stop_calls_entry_point() {
        let mut entry = MockNativeEntryPoint::new();
        entry.expect_is_running().returning(|_| true);
        entry.expect_stop().times(1).returning(|_| 0);

        let handle = attach(
            Launched::Native {
                handle: 5,
                entry: Arc::new(entry),
            },
            LaunchMethod::Real(StrategyKind::SecondaryNative),
            EventHub::new(),
            timings(),
        );
        assert!(handle.signal(ControlSignal::Terminate));
        let exit = tokio::time::timeout(Duration::from_secs(2), handle.wait_exit()).await.unwrap();
        assert!(exit.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_output_and_exit_code() {
        let events = EventHub::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_cb = lines.clone();
        let _sub = events.on_log(move |event| lines_cb.lock().push(event.line.clone()));

        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("echo '[I] start proxy success'; echo '[E] oops' 1>&2; exit 3")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let method = LaunchMethod::Real(StrategyKind::ShellExec);
        let handle = attach(Launched::Child(child), method, events.clone(), timings());
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit()).await.unwrap();
        assert_eq!(exit, Some(ExitInfo { code: Some(3) }));

        let lines = lines.lock();
        assert!(lines.contains(&"[I] start proxy success".to_string()));
        assert!(lines.contains(&"[E] oops".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_signal_stops_child() {
        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exec sleep 30")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let handle = attach(
            Launched::Child(child),
            LaunchMethod::Real(StrategyKind::DirectExec),
            EventHub::new(),
            timings(),
        );
        assert!(handle.pid.is_some());
        assert!(handle.signal(ControlSignal::Terminate));

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit()).await.unwrap();
        // Killed by SIGTERM: no exit code
        assert_eq!(exit, Some(ExitInfo { code: None }));
        assert_eq!(handle.exit_info(), exit);
    }
}
