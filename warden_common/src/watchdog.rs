//! # Watchdog Trait
//!
//! Defines the supervisor contract for worker lifecycle management.
//! The `warden` binary implements this trait to launch, track, message,
//! and shut down the single worker process.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use crate::consts::UNRECOVERABLE_EXIT;
use crate::message::Event;

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WorkerState {
    /// No worker and no launch outstanding.
    #[default]
    Idle,
    /// Worker spawned, PID announcement not yet received.
    Launching,
    /// Worker connected and announced its PID.
    Running,
    /// Shutdown requested, waiting for the worker to go away.
    ShuttingDown,
    /// Connection lost; cleanup in progress.
    Crashed,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Not reaped in time, or status unavailable.
    Unknown,
}

impl WorkerExit {
    /// Classify a reaped status.
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            WorkerExit::Exited(code)
        } else if let Some(sig) = status.signal() {
            WorkerExit::Signaled(sig)
        } else {
            WorkerExit::Unknown
        }
    }

    /// False when the worker asked not to be restarted.
    pub fn is_recoverable(self) -> bool {
        self != WorkerExit::Exited(UNRECOVERABLE_EXIT)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Exited(code) => write!(f, "exited with status {code}"),
            WorkerExit::Signaled(sig) => write!(f, "terminated by signal {sig}"),
            WorkerExit::Unknown => f.write_str("exit status unknown"),
        }
    }
}

/// Error type for watchdog operations.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    /// A launch is already outstanding.
    #[error("a worker launch is already in progress")]
    LaunchPending,

    /// A worker is already running.
    #[error("worker already running (pid {pid})")]
    AlreadyRunning {
        /// Worker process id.
        pid: i32,
    },

    /// The worker binary does not exist.
    #[error("worker binary {0} does not exist")]
    BinaryNotFound(PathBuf),

    /// The worker binary is not readable and executable.
    #[error("worker binary {0} is not executable")]
    NotExecutable(PathBuf),

    /// Failed to spawn the worker.
    #[error("failed to spawn {path}: {reason}")]
    SpawnFailed {
        /// Binary path.
        path: PathBuf,
        /// OS error text.
        reason: String,
    },

    /// Event could not be queued.
    #[error("cannot send {event:?}: {reason}")]
    SendFailed {
        /// Event that was refused.
        event: Event,
        /// Why it was refused.
        reason: String,
    },

    /// Generic I/O or system error.
    #[error("watchdog error: {0}")]
    Other(String),
}

/// Supervisor contract for worker lifecycle management.
pub trait Watchdog {
    /// Launch the worker. Returns the spawned PID.
    ///
    /// Fails when a launch is outstanding or a worker is already running.
    fn start_worker(&mut self) -> Result<i32, WatchdogError>;

    /// Current lifecycle state.
    fn worker_state(&self) -> WorkerState;

    /// Queue an event for the worker.
    fn send_event(&self, event: Event, payload: &[u8]) -> Result<(), WatchdogError>;

    /// Ask the worker to exit and stop relaunching it.
    fn shutdown(&mut self) -> Result<(), WatchdogError>;
}
