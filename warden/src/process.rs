//! Worker launching and process-supervision bookkeeping.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::info;
use warden_common::config::SupervisorConfig;
use warden_common::consts::RUNTIME_DIR_ENV;
use warden_common::watchdog::{WatchdogError, WorkerExit, WorkerState};

use crate::platform;

/// Spawns the worker binary.
#[derive(Debug, Clone)]
pub struct Launcher {
    binary: PathBuf,
    args: Vec<String>,
    runtime_dir: PathBuf,
}

impl Launcher {
    /// Launcher for the configured worker binary.
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            binary: config.worker_binary.clone(),
            args: config.worker_args.clone(),
            runtime_dir: config.runtime_dir.clone(),
        }
    }

    /// Worker binary path.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Check the binary and spawn it with the runtime directory exported.
    pub fn spawn(&self) -> Result<Child, WatchdogError> {
        if !platform::exists(&self.binary) {
            return Err(WatchdogError::BinaryNotFound(self.binary.clone()));
        }
        if !platform::is_executable(&self.binary) {
            return Err(WatchdogError::NotExecutable(self.binary.clone()));
        }
        let child = Command::new(&self.binary)
            .args(&self.args)
            .env(RUNTIME_DIR_ENV, &self.runtime_dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| WatchdogError::SpawnFailed {
                path: self.binary.clone(),
                reason: e.to_string(),
            })?;
        info!(pid = child.id(), binary = %self.binary.display(), "worker spawned");
        Ok(child)
    }
}

/// Relaunch delay: starts at one second, doubles per quick failure up to a
/// ceiling, and resets once a worker stays up for at least the ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Backoff capped at `max`.
    pub fn new(max: Duration) -> Self {
        let initial = Duration::from_secs(1).min(max);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before relaunching a worker that ran for `uptime`.
    pub fn on_exit(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.max {
            self.next = self.initial;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Delay after a failed launch attempt.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Process-supervision state owned by the supervisor loop.
#[derive(Debug)]
pub struct WorkerProcess {
    /// Announced (or spawned) worker PID.
    pub pid: Option<i32>,
    /// Handle of a worker we spawned.
    pub child: Option<Child>,
    /// Lifecycle state.
    pub state: WorkerState,
    /// When the current worker was launched.
    pub started_at: Option<Instant>,
    /// Number of launches so far.
    pub restart_count: u32,
    /// False once a worker exits with the unrecoverable status.
    pub recoverable: bool,
    /// Keep a worker running.
    pub run_worker: bool,
    /// How the previous worker ended.
    pub last_exit: Option<WorkerExit>,
    /// Earliest time housekeeping may launch again.
    pub next_launch: Option<Instant>,
    /// PID for which a broken-connection alarm was already raised.
    pub broken_alarmed: Option<i32>,
    /// Relaunch delay policy.
    pub backoff: Backoff,
}

impl WorkerProcess {
    /// Fresh state.
    pub fn new(run_worker: bool, max_backoff: Duration) -> Self {
        Self {
            pid: None,
            child: None,
            state: WorkerState::Idle,
            started_at: None,
            restart_count: 0,
            recoverable: true,
            run_worker,
            last_exit: None,
            next_launch: None,
            broken_alarmed: None,
            backoff: Backoff::new(max_backoff),
        }
    }

    /// A launch is outstanding.
    pub fn launch_pending(&self) -> bool {
        self.state == WorkerState::Launching
    }

    /// A worker is connected and announced.
    pub fn running(&self) -> bool {
        self.state == WorkerState::Running
    }

    /// Housekeeping should launch now.
    pub fn wants_launch(&self, now: Instant) -> bool {
        self.run_worker
            && self.recoverable
            && self.state == WorkerState::Idle
            && self.next_launch.is_none_or(|t| now >= t)
    }

    /// Record a successful spawn.
    pub fn launched(&mut self, child: Child) {
        self.pid = Some(child.id() as i32);
        self.child = Some(child);
        self.state = WorkerState::Launching;
        self.started_at = Some(Instant::now());
        self.restart_count += 1;
        self.next_launch = None;
    }

    /// Uptime of the current or last worker.
    pub fn uptime(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }
}
