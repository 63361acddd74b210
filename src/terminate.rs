use std::sync::Arc;
use tracing::debug;

use crate::errors::BackendError;

/// Requests termination of a supervised process by pid.
///
/// Implementations must not wait for the process to exit; the exit observer
/// owns the child and records the exit.
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<(), BackendError>;
}

/// SIGTERM on POSIX so the backend can shut down its listener cleanly
#[cfg(unix)]
pub struct SignalTerminator;

#[cfg(unix)]
impl Terminator for SignalTerminator {
    fn terminate(&self, pid: u32) -> Result<(), BackendError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| BackendError::Termination(format!("pid {pid} out of range")))?;

        debug!(pid, "sending SIGTERM to backend");
        match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            // Already gone
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(BackendError::Termination(format!(
                "SIGTERM to {pid} failed: {errno}"
            ))),
        }
    }
}

/// Kills the whole process tree on Windows.
///
/// A backend started through a wrapper leaves its real server as a grandchild
/// that a plain `TerminateProcess` on the direct child would orphan.
#[cfg(windows)]
pub struct ProcessTreeTerminator;

#[cfg(windows)]
impl Terminator for ProcessTreeTerminator {
    fn terminate(&self, pid: u32) -> Result<(), BackendError> {
        use std::process::{Command, Stdio};

        debug!(pid, "killing backend process tree");
        Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| BackendError::Termination(format!("taskkill failed to start: {e}")))
    }
}

/// Termination strategy for the current target
pub fn platform_terminator() -> Arc<dyn Terminator> {
    #[cfg(unix)]
    {
        Arc::new(SignalTerminator)
    }

    #[cfg(windows)]
    {
        Arc::new(ProcessTreeTerminator)
    }
}
