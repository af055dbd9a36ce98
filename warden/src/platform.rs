//! POSIX process helpers: liveness probes, access checks, bounded reaping.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal as OsSignal};
use nix::unistd::{access, AccessFlags, Pid};
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Check whether a process with the given PID exists.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Null signal: existence probe only.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Deliver SIGKILL. A process that is already gone is not an error.
pub fn kill_hard(pid: i32) -> nix::Result<()> {
    match kill(Pid::from_raw(pid), OsSignal::SIGKILL) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// Does `path` exist at all.
pub fn exists(path: &Path) -> bool {
    access(path, AccessFlags::F_OK).is_ok()
}

/// Is `path` readable and executable by this process.
pub fn is_executable(path: &Path) -> bool {
    access(path, AccessFlags::R_OK | AccessFlags::X_OK).is_ok()
}

/// Result of [`wait_with_deadline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    /// Child exited on its own within the deadline.
    Exited(ExitStatus),
    /// Deadline passed; the child was SIGKILLed and then reaped.
    Killed(Option<ExitStatus>),
}

impl Reaped {
    /// Exit status, if one was collected.
    pub fn status(self) -> Option<ExitStatus> {
        match self {
            Reaped::Exited(status) => Some(status),
            Reaped::Killed(status) => status,
        }
    }
}

/// Wait for `child` to exit for at most `deadline`, then SIGKILL and reap it.
///
/// A dedicated thread owns the blocking `wait`; the caller blocks on a
/// channel with a timeout.
pub fn wait_with_deadline(mut child: Child, deadline: Duration) -> Reaped {
    let pid = child.id() as i32;
    let (tx, rx) = mpsc::channel();
    let waiter = thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || {
            let _ = tx.send(child.wait().ok());
        });

    let waiter = match waiter {
        Ok(handle) => handle,
        Err(e) => {
            warn!(pid, "cannot spawn reaper thread: {e}; killing immediately");
            let _ = kill_hard(pid);
            return Reaped::Killed(None);
        }
    };

    let outcome = match rx.recv_timeout(deadline) {
        Ok(Some(status)) => Reaped::Exited(status),
        Ok(None) => Reaped::Killed(None),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(pid, "child still running after {deadline:?}; sending SIGKILL");
            if let Err(e) = kill_hard(pid) {
                warn!(pid, "SIGKILL failed: {e}");
            }
            Reaped::Killed(rx.recv().ok().flatten())
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Reaped::Killed(None),
    };
    let _ = waiter.join();
    outcome
}
