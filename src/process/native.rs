// src/process/native.rs
// Compiled-in entry points that start the agent without going through tokio::process

use std::path::Path;

#[cfg(test)]
use mockall::automock;

/// Launch/poll/stop contract of a native entry point.
///
/// `start` returns a positive handle on success and zero or a negative code on
/// failure. Handles are only meaningful to the entry point that produced them.
#[cfg_attr(test, automock)]
pub trait NativeEntryPoint: Send + Sync {
    fn start(&self, binary: &Path, config: &Path) -> i32;
    fn is_running(&self, handle: i32) -> bool;
    fn stop(&self, handle: i32) -> i32;
}

pub const START_FORK_FAILED: i32 = -1;
pub const START_NOT_EXECUTABLE: i32 = -2;
pub const START_BAD_PATH: i32 = -3;

#[cfg(unix)]
pub use unix::ForkExecEntryPoint;

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::utils::command::{default_shell, exec_script, is_executable};
    use nix::errno::Errno;
    use nix::libc;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    const STOP_GRACE: Duration = Duration::from_secs(2);
    const STOP_POLL: Duration = Duration::from_millis(100);

    /// fork + exec of the agent binary.
    ///
    /// The secondary variant carries a shell; if exec'ing the binary fails in the
    /// child, it execs `<shell> -c "exec <binary> -c <config>"` instead.
    pub struct ForkExecEntryPoint {
        shell_fallback: Option<PathBuf>,
    }

    impl ForkExecEntryPoint {
        pub fn primary() -> Self {
            Self { shell_fallback: None }
        }

        pub fn secondary() -> Self {
            Self {
                shell_fallback: Some(default_shell()),
            }
        }

        pub fn with_shell(shell: PathBuf) -> Self {
            Self {
                shell_fallback: Some(shell),
            }
        }
    }

    // argv arrays built before fork; the child must not allocate
    struct ExecImage {
        program: CString,
        _args: Vec<CString>,
        argv: Vec<*const libc::c_char>,
    }

    impl ExecImage {
        fn new(program: &Path, args: Vec<CString>) -> Option<Self> {
            let program = CString::new(program.as_os_str().as_bytes()).ok()?;
            let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
            argv.push(std::ptr::null());
            Some(Self {
                program,
                _args: args,
                argv,
            })
        }

        // Only returns if execv failed
        unsafe fn exec(&self) {
            libc::execv(self.program.as_ptr(), self.argv.as_ptr());
        }
    }

    fn c_arg(value: &[u8]) -> Option<CString> {
        CString::new(value).ok()
    }

    impl NativeEntryPoint for ForkExecEntryPoint {
        fn start(&self, binary: &Path, config: &Path) -> i32 {
            if !is_executable(binary) {
                log::error!("Native start refused, {:?} is not executable", binary);
                return START_NOT_EXECUTABLE;
            }

            let direct = match (c_arg(b"frpc"), c_arg(b"-c"), c_arg(config.as_os_str().as_bytes())) {
                (Some(argv0), Some(flag), Some(config)) => ExecImage::new(binary, vec![argv0, flag, config]),
                _ => None,
            };
            let Some(direct) = direct else {
                return START_BAD_PATH;
            };

            let fallback = match &self.shell_fallback {
                Some(shell) => {
                    let script = exec_script(binary, config);
                    match (c_arg(b"sh"), c_arg(b"-c"), c_arg(script.as_bytes())) {
                        (Some(argv0), Some(flag), Some(script)) => ExecImage::new(shell, vec![argv0, flag, script]),
                        _ => return START_BAD_PATH,
                    }
                }
                None => None,
            };

            // SAFETY: the child only calls execv and _exit, both async-signal-safe,
            // on memory prepared above.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => unsafe {
                    direct.exec();
                    if let Some(fallback) = &fallback {
                        fallback.exec();
                    }
                    libc::_exit(127);
                },
                Ok(ForkResult::Parent { child }) => {
                    log::info!("Native entry point forked agent with pid {}", child);
                    child.as_raw()
                }
                Err(e) => {
                    log::error!("Failed to fork agent process: {}", e);
                    START_FORK_FAILED
                }
            }
        }

        fn is_running(&self, handle: i32) -> bool {
            if handle <= 0 {
                return false;
            }
            let pid = Pid::from_raw(handle);
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                Ok(_) => false,
                // Not our child (or already reaped); fall back to a liveness probe
                Err(Errno::ECHILD) => kill(pid, None).is_ok(),
                Err(_) => false,
            }
        }

        fn stop(&self, handle: i32) -> i32 {
            if handle <= 0 {
                return -1;
            }
            let pid = Pid::from_raw(handle);

            match kill(pid, Signal::SIGTERM) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
                    return 0;
                }
                Err(e) => {
                    log::error!("Failed to send SIGTERM to {}: {}", pid, e);
                    return -1;
                }
            }

            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline {
                if !self.is_running(handle) {
                    log::info!("Native agent {} stopped", pid);
                    return 0;
                }
                std::thread::sleep(STOP_POLL);
            }

            log::warn!("Native agent {} ignored SIGTERM, force killing", pid);
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    log::error!("Failed to send SIGKILL to {}: {}", pid, e);
                    return -1;
                }
            }
            let _ = waitpid(pid, None);
            0
        }
    }

}
