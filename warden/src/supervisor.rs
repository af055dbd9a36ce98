//! The supervisor: listening socket, worker connection, and the poll loop
//! that moves frames between them.
//!
//! # Threading
//!
//! One thread owns the [`Supervisor`] and calls [`Supervisor::run_once`]
//! in a loop. Every other thread talks to it through a
//! cloned [`SupervisorHandle`], which only enqueues events and pokes the
//! wake channel.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─start─▶ Launching ─Pid frame─▶ Running ─EOF─▶ Crashed ─▶ Idle
//!                                          │
//!                                          └─Shutdown/Bounce─▶ ShuttingDown ─EOF─▶ Idle
//! ```

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use warden_common::bus::MessageBus;
use warden_common::config::SupervisorConfig;
use warden_common::consts::MAX_MESSAGES_PER_PASS;
use warden_common::message::{decode_child_pair, payload_text, Event, Message, Signal};
use warden_common::watchdog::{Watchdog, WatchdogError, WorkerExit, WorkerState};
use warden_common::wire::{read_message, write_message, WireError};

use crate::alarms::{AlarmCenter, AlarmKind};
use crate::context::Context;
use crate::error::SupervisorError;
use crate::platform::{self, Reaped};
use crate::process::{Launcher, WorkerProcess};
use crate::registry::ConfigRegistry;

/// Cloneable, thread-safe way to reach a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    events: Arc<MessageBus>,
    wake: Arc<UnixStream>,
}

impl SupervisorHandle {
    /// Queue an event for the worker and wake the poll loop.
    pub fn send_event(&self, event: Event, payload: impl Into<Vec<u8>>) {
        self.events.enqueue(Message::event(event, payload));
        self.wake();
    }

    /// Interrupt the current multiplex wait.
    pub fn wake(&self) {
        match (&*self.wake).write(&[1]) {
            Ok(_) => {}
            // A full buffer already guarantees a wakeup.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => debug!("wake write failed: {e}"),
        }
    }
}

/// Worker supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    ctx: Context,
    socket_path: PathBuf,
    listener: UnixListener,
    conn: Option<UnixStream>,
    wake_rx: UnixStream,
    handle: SupervisorHandle,
    signals: MessageBus,
    launcher: Launcher,
    worker: WorkerProcess,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("socket", &self.socket_path)
            .field("state", &self.worker.state)
            .field("pid", &self.worker.pid)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl Supervisor {
    /// Bind the listening socket and install the built-in signal handlers.
    ///
    /// Does not launch anything; the first [`run_once`](Self::run_once)
    /// pass does when `run_worker` is set.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when a live supervisor owns the socket path.
    pub fn new(config: SupervisorConfig, ctx: Context) -> Result<Self, SupervisorError> {
        let socket_path = config.socket_path();
        let listener = bind_listener(&socket_path)?;
        listener.set_nonblocking(true)?;

        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;

        let handle = SupervisorHandle {
            events: Arc::new(MessageBus::new()),
            wake: Arc::new(wake_tx),
        };
        let signals = MessageBus::new();
        install_signal_handlers(&signals, &ctx);

        info!(socket = %socket_path.display(), "supervisor listening");
        Ok(Self {
            launcher: Launcher::new(&config),
            worker: WorkerProcess::new(config.run_worker, config.max_relaunch_backoff()),
            config,
            ctx,
            socket_path,
            listener,
            conn: None,
            wake_rx,
            handle,
            signals,
        })
    }

    /// Handle for other threads.
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Shared services.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Alarm center.
    pub fn alarms(&self) -> &AlarmCenter {
        &self.ctx.alarms
    }

    /// Configuration registry.
    pub fn configs(&self) -> &ConfigRegistry {
        &self.ctx.configs
    }

    /// Listening socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Process-supervision state.
    pub fn worker(&self) -> &WorkerProcess {
        &self.worker
    }

    /// Turn auto-launch on or off.
    pub fn set_run_worker(&mut self, run: bool) {
        self.worker.run_worker = run;
    }

    /// Register an extra handler for a worker signal. Handlers run on the
    /// poll thread after the built-in ones.
    pub fn register_signal_callback<F>(&self, signal: Signal, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.signals.register(signal.id(), callback);
    }

    /// Forward every configuration change to the worker as a
    /// `ConfigFileUpdate` event carrying the config key.
    pub fn forward_config_changes(&self) {
        let handle = self.handle();
        self.ctx.configs.register_callback(move |_, key| {
            handle.send_event(Event::ConfigFileUpdate, key.as_bytes().to_vec());
            Ok(())
        });
    }

    /// One pass: flush queued events, wait for readiness, service the
    /// listener, the worker connection and the wake channel, then do
    /// housekeeping (launch timeout, relaunch).
    pub fn run_once(&mut self) -> Result<(), SupervisorError> {
        self.flush_events();

        let timeout = poll_timeout(self.config.poll_timeout());
        let (accept_ready, conn_ready, wake_ready) = {
            let mut fds = vec![
                PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            if let Some(conn) = &self.conn {
                fds.push(PollFd::new(conn.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            (
                is_ready(&fds[0]),
                fds.get(2).is_some_and(is_ready),
                is_ready(&fds[1]),
            )
        };

        if wake_ready {
            self.drain_wake();
        }
        if accept_ready {
            self.accept();
        }
        if conn_ready {
            self.read_frames();
        }
        self.housekeeping();
        Ok(())
    }

    /// Launch the worker now.
    ///
    /// # Errors
    ///
    /// `LaunchPending` while a launch is outstanding, `AlreadyRunning`
    /// while a worker is connected, or a spawn failure.
    pub fn start(&mut self) -> Result<i32, WatchdogError> {
        match self.worker.state {
            WorkerState::Launching => return Err(WatchdogError::LaunchPending),
            WorkerState::Running | WorkerState::ShuttingDown => {
                return Err(WatchdogError::AlreadyRunning {
                    pid: self.worker.pid.unwrap_or(-1),
                });
            }
            WorkerState::Idle | WorkerState::Crashed => {}
        }
        let child = self.launcher.spawn()?;
        let pid = child.id() as i32;
        self.worker.launched(child);
        info!(pid, launches = self.worker.restart_count, "worker launching");
        Ok(pid)
    }

    /// Stop auto-launch, ask the worker to exit, wait up to the reap
    /// timeout, kill it if needed, and remove the socket file.
    pub fn shutdown_worker(&mut self) {
        self.worker.run_worker = false;
        let deadline = Instant::now() + self.config.reap_timeout();

        if let Some(conn) = self.conn.as_mut() {
            match write_message(conn, &Message::event(Event::Shutdown, Vec::new())) {
                Ok(()) => {
                    self.worker.state = WorkerState::ShuttingDown;
                    wait_for_eof(conn, deadline);
                }
                Err(e) => debug!("shutdown not delivered: {e}"),
            }
        }
        self.conn = None;

        if let Some(child) = self.worker.child.take() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reaped = platform::wait_with_deadline(child, remaining);
            self.worker.last_exit = Some(exit_of(reaped));
        }
        self.worker.pid = None;
        self.worker.state = WorkerState::Idle;

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), "cannot remove socket: {e}");
            }
        }
        info!("supervisor shut down");
    }

    // ─── Send path ──────────────────────────────────────────────────

    fn flush_events(&mut self) {
        let mut batch = self.handle.events.drain(MAX_MESSAGES_PER_PASS).into_iter();
        let mut deferred = Vec::new();

        while let Some(msg) = batch.next() {
            let event = msg.as_event();
            match event {
                Some(Event::Restart) => {
                    info!("restart requested; auto-launch re-armed");
                    self.worker.run_worker = true;
                    self.worker.recoverable = true;
                    self.worker.next_launch = None;
                    continue;
                }
                Some(Event::Shutdown) => self.worker.run_worker = false,
                Some(Event::ConfigFileUpdate) => {
                    let key = payload_text(&msg.payload);
                    if !self.ctx.configs.has_key(&key) {
                        warn!(key = %key, "update for unregistered config key dropped");
                        continue;
                    }
                }
                _ => {}
            }

            let stops_worker = matches!(event, Some(Event::Shutdown | Event::Bounce));
            match self.worker.state {
                WorkerState::Running => {}
                WorkerState::Launching => {
                    deferred.push(msg);
                    continue;
                }
                _ => {
                    if stops_worker || event == Some(Event::ConfigFileUpdate) {
                        debug!(msg_type = msg.msg_type, "no worker; event applied locally");
                    } else {
                        deferred.push(msg);
                    }
                    continue;
                }
            }

            let Some(conn) = self.conn.as_mut() else {
                deferred.push(msg);
                continue;
            };
            let bounce_as_shutdown;
            let outgoing = if event == Some(Event::Bounce) {
                bounce_as_shutdown = Message::event(Event::Shutdown, msg.payload.clone());
                &bounce_as_shutdown
            } else {
                &msg
            };
            match write_message(conn, outgoing) {
                Ok(()) => {
                    debug!(msg_type = outgoing.msg_type, len = msg.payload.len(), "event sent");
                    if stops_worker {
                        self.worker.state = WorkerState::ShuttingDown;
                    }
                }
                Err(e) => {
                    if self.on_write_failure(e) {
                        deferred.push(msg);
                        deferred.extend(batch.by_ref());
                        break;
                    }
                }
            }
        }
        self.handle.events.requeue_front(deferred);
    }

    /// Returns true when the connection is gone and the message should
    /// wait for the next worker.
    fn on_write_failure(&mut self, err: WireError) -> bool {
        let stalled = matches!(&err, WireError::Io(e)
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
        if !stalled && !err.is_disconnect() {
            warn!("event not sent: {err}");
            return false;
        }
        let pid = self.worker.pid.unwrap_or(-1);
        if !platform::is_process_alive(pid) {
            warn!(pid, "worker gone while sending: {err}");
            self.on_disconnect();
            return true;
        }
        if self.worker.broken_alarmed != Some(pid) {
            self.worker.broken_alarmed = Some(pid);
            let text = format!("connection to worker pid {pid} broken: {err}");
            self.ctx
                .alarms
                .signal(AlarmKind::SystemError, None, Some(&text));
        }
        if !stalled {
            return false;
        }
        // A timed-out write may have left half a frame on the stream.
        warn!(pid, "worker stopped reading its socket; dropping the connection");
        if let Some(conn) = self.conn.as_ref() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
        self.on_disconnect();
        true
    }

    // ─── Receive path ───────────────────────────────────────────────

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if self.conn.is_some() {
                        warn!("second worker connection refused");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_read_timeout(Some(self.config.reap_timeout())))
                        .and_then(|_| stream.set_write_timeout(Some(self.config.reap_timeout())))
                    {
                        warn!("cannot configure worker connection: {e}");
                        continue;
                    }
                    debug!("worker connected");
                    self.conn = Some(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn read_frames(&mut self) {
        for _ in 0..MAX_MESSAGES_PER_PASS {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            let msg = match read_message(conn) {
                Ok(msg) => msg,
                Err(e) if e.is_disconnect() => {
                    debug!("worker connection closed: {e}");
                    self.on_disconnect();
                    return;
                }
                Err(e) => {
                    error!("protocol error from worker: {e}");
                    if let Some(conn) = self.conn.as_ref() {
                        let _ = conn.shutdown(std::net::Shutdown::Both);
                    }
                    self.on_disconnect();
                    return;
                }
            };
            self.handle_signal(msg);

            match self.conn.as_ref() {
                Some(conn) if readable_now(conn) => continue,
                _ => return,
            }
        }
    }

    fn handle_signal(&mut self, msg: Message) {
        match msg.as_signal() {
            Some(Signal::Pid) => {
                let Some(pid) = msg.as_i32() else {
                    warn!(len = msg.payload.len(), "malformed pid announcement ignored");
                    return;
                };
                self.on_worker_announced(pid);
            }
            Some(signal) => debug!(?signal, len = msg.payload.len(), "signal received"),
            None => debug!(msg_type = msg.msg_type, "unknown signal id"),
        }
        self.signals.dispatch(&msg);
    }

    fn on_worker_announced(&mut self, pid: i32) {
        if let Some(child) = &self.worker.child {
            if child.id() as i32 != pid {
                warn!(spawned = child.id(), announced = pid, "worker pid mismatch");
            }
        }
        self.worker.pid = Some(pid);
        self.worker.state = WorkerState::Running;

        let reply = Message::with_i32(Event::SyncKey.id(), self.config.sync_key);
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = write_message(conn, &reply) {
                warn!(pid, "sync key not delivered: {e}");
            }
        }
        info!(pid, "worker running");
        self.ctx.alarms.signal(
            AlarmKind::ProcessBorn,
            None,
            Some(&format!("worker pid {pid} born")),
        );
    }

    fn on_disconnect(&mut self) {
        self.conn = None;
        let previous = self.worker.state;
        if previous == WorkerState::Running || previous == WorkerState::Launching {
            self.worker.state = WorkerState::Crashed;
        }
        let pid = self.worker.pid.take();

        let exit = match self.worker.child.take() {
            Some(child) => exit_of(platform::wait_with_deadline(child, self.config.reap_timeout())),
            None => WorkerExit::Unknown,
        };
        match exit {
            WorkerExit::Signaled(sig) => warn!(?pid, sig, "worker {exit}"),
            _ => info!(?pid, "worker {exit}"),
        }
        if !exit.is_recoverable() {
            error!(?pid, "worker reported an unrecoverable failure; auto-restart disabled");
            self.worker.recoverable = false;
        }
        if self.worker.run_worker && previous != WorkerState::ShuttingDown {
            self.ctx.alarms.signal(AlarmKind::ProcessDied, None, None);
        }

        self.worker.last_exit = Some(exit);
        let delay = if previous == WorkerState::ShuttingDown {
            Duration::ZERO
        } else {
            self.worker.backoff.on_exit(self.worker.uptime())
        };
        self.worker.next_launch = Some(Instant::now() + delay);
        self.worker.state = WorkerState::Idle;
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    // ─── Housekeeping ───────────────────────────────────────────────

    fn housekeeping(&mut self) {
        if self.worker.state == WorkerState::Launching && self.conn.is_none() {
            let exited = self
                .worker
                .child
                .as_mut()
                .is_some_and(|child| matches!(child.try_wait(), Ok(Some(_))));
            if exited {
                warn!(pid = ?self.worker.pid, "worker exited before announcing itself");
                self.on_disconnect();
            } else if self.worker.uptime() > self.config.launch_timeout() {
                warn!(pid = ?self.worker.pid, "worker did not announce itself in time; killing");
                if let Some(child) = &self.worker.child {
                    if let Err(e) = platform::kill_hard(child.id() as i32) {
                        warn!("SIGKILL failed: {e}");
                    }
                }
                self.on_disconnect();
            }
        }

        if self.worker.wants_launch(Instant::now()) {
            if let Err(e) = self.start() {
                let delay = self.worker.backoff.on_failure();
                error!("worker launch failed: {e}; retrying in {delay:?}");
                self.worker.next_launch = Some(Instant::now() + delay);
            }
        }
    }
}

impl Watchdog for Supervisor {
    fn start_worker(&mut self) -> Result<i32, WatchdogError> {
        self.start()
    }

    fn worker_state(&self) -> WorkerState {
        self.worker.state
    }

    fn send_event(&self, event: Event, payload: &[u8]) -> Result<(), WatchdogError> {
        if payload.len() > warden_common::consts::MAX_PAYLOAD_LEN {
            return Err(WatchdogError::SendFailed {
                event,
                reason: format!("payload of {} bytes is too large", payload.len()),
            });
        }
        self.handle.send_event(event, payload.to_vec());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), WatchdogError> {
        self.shutdown_worker();
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(child) = self.worker.child.as_mut() {
            let _ = platform::kill_hard(child.id() as i32);
            let _ = child.wait();
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

/// Map worker signals onto alarms and the config registry.
fn install_signal_handlers(bus: &MessageBus, ctx: &Context) {
    let to_alarm = [
        (Signal::ProcessDied, AlarmKind::ProcessDied),
        (Signal::ProcessBorn, AlarmKind::ProcessBorn),
        (Signal::ConfigError, AlarmKind::ConfigError),
        (Signal::SystemError, AlarmKind::SystemError),
        (Signal::LogSpaceCrisis, AlarmKind::LogSpaceCrisis),
        (Signal::CacheError, AlarmKind::CacheError),
        (Signal::CacheWarning, AlarmKind::CacheWarning),
        (Signal::LoggingError, AlarmKind::LoggingError),
        (Signal::LoggingWarning, AlarmKind::LoggingWarning),
    ];
    for (signal, kind) in to_alarm {
        let alarms = Arc::clone(&ctx.alarms);
        bus.register(signal.id(), move |payload| {
            let text = payload_text(payload);
            let desc = (!text.is_empty()).then_some(&*text);
            alarms.signal(kind, None, desc);
        });
    }

    let configs = Arc::clone(&ctx.configs);
    bus.register(Signal::ConfigFileChild.id(), move |payload| {
        match decode_child_pair(payload) {
            Some((parent, child)) => {
                configs.config_file_child(&parent, &child);
            }
            None => warn!("malformed config-file-child payload"),
        }
    });

    bus.register(Signal::PluginSetConfig.id(), |payload| {
        info!(request = %payload_text(payload), "plugin set-config request");
    });
    bus.register(Signal::Librecords.id(), |payload| {
        debug!(len = payload.len(), "librecords message");
    });
}

/// Bind `path`, clearing a stale socket file nobody answers on.
fn bind_listener(path: &Path) -> Result<UnixListener, SupervisorError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let bind = |path: &Path| {
        UnixListener::bind(path).map_err(|source| SupervisorError::Bind {
            path: path.to_path_buf(),
            source,
        })
    };
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(SupervisorError::AlreadyRunning(path.to_path_buf()));
            }
            debug!(socket = %path.display(), "removing stale socket");
            fs::remove_file(path)?;
            bind(path)
        }
        Err(source) => Err(SupervisorError::Bind {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn poll_timeout(d: Duration) -> PollTimeout {
    PollTimeout::from(d.as_millis().min(u128::from(u16::MAX)) as u16)
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

fn readable_now(stream: &UnixStream) -> bool {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
    matches!(poll(&mut fds, PollTimeout::from(0u16)), Ok(n) if n > 0) && is_ready(&fds[0])
}

/// Read and discard until the peer closes or `deadline` passes.
fn wait_for_eof(conn: &mut UnixStream, deadline: Instant) {
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        if conn.set_read_timeout(Some(remaining)).is_err() {
            return;
        }
        match conn.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

fn exit_of(reaped: Reaped) -> WorkerExit {
    reaped
        .status()
        .map_or(WorkerExit::Unknown, WorkerExit::from_status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::Raised;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use warden_common::message::encode_child_pair;

    // ─── Helpers ────────────────────────────────────────────────────

    fn config(dir: &TempDir) -> SupervisorConfig {
        SupervisorConfig {
            runtime_dir: dir.path().to_path_buf(),
            worker_binary: dir.path().join("no-such-worker"),
            run_worker: false,
            poll_timeout_ms: 20,
            reap_timeout_s: 2,
            ..SupervisorConfig::default()
        }
    }

    fn pump_until(sup: &mut Supervisor, limit: Duration, mut done: impl FnMut(&Supervisor) -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            sup.run_once().expect("run_once");
            if done(sup) {
                return true;
            }
        }
        false
    }

    /// Connect as a fake worker and announce `pid`.
    fn fake_worker(sup: &mut Supervisor, pid: i32) -> UnixStream {
        let mut stream = UnixStream::connect(sup.socket_path()).expect("connect");
        write_message(&mut stream, &Message::with_i32(Signal::Pid.id(), pid)).expect("pid");
        assert!(pump_until(sup, Duration::from_secs(5), |s| s.worker_state() == WorkerState::Running));
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let key = read_message(&mut stream).expect("sync key");
        assert_eq!(key.as_event(), Some(Event::SyncKey));
        stream
    }

    // ─── Socket ─────────────────────────────────────────────────────

    #[test]
    fn second_supervisor_is_refused() {
        let dir = TempDir::new().unwrap();
        let _first = Supervisor::new(config(&dir), Context::default()).expect("first");
        let err = Supervisor::new(config(&dir), Context::default()).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        {
            let listener = UnixListener::bind(cfg.socket_path()).expect("bind");
            drop(listener);
        }
        assert!(cfg.socket_path().exists());
        let sup = Supervisor::new(cfg, Context::default()).expect("rebind");
        assert!(sup.socket_path().exists());
    }

    #[test]
    fn socket_removed_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let path = sup.socket_path().to_path_buf();
        sup.shutdown_worker();
        assert!(!path.exists());
    }

    // ─── Handshake ──────────────────────────────────────────────────

    #[test]
    fn pid_announcement_gets_sync_key() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.sync_key = 4242;
        let mut sup = Supervisor::new(cfg, Context::default()).expect("sup");

        let mut stream = UnixStream::connect(sup.socket_path()).expect("connect");
        write_message(&mut stream, &Message::with_i32(Signal::Pid.id(), 777)).unwrap();
        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker().running()));
        assert_eq!(sup.worker().pid, Some(777));

        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(read_message(&mut stream).unwrap().as_i32(), Some(4242));
    }

    #[test]
    fn second_connection_is_closed() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let _first = fake_worker(&mut sup, 100);

        let mut second = UnixStream::connect(sup.socket_path()).expect("connect");
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        pump_until(&mut sup, Duration::from_millis(200), |_| false);
        assert!(matches!(read_message(&mut second), Err(WireError::Closed)));
        assert_eq!(sup.worker().pid, Some(100));
    }

    // ─── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_wait_for_a_worker_and_keep_order() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let handle = sup.handle();
        handle.send_event(Event::ClearStats, Vec::new());
        handle.send_event(Event::RollLogFiles, Vec::new());
        pump_until(&mut sup, Duration::from_millis(100), |_| false);

        let mut stream = fake_worker(&mut sup, 200);
        pump_until(&mut sup, Duration::from_millis(100), |_| false);
        assert_eq!(read_message(&mut stream).unwrap().as_event(), Some(Event::ClearStats));
        assert_eq!(read_message(&mut stream).unwrap().as_event(), Some(Event::RollLogFiles));
    }

    #[test]
    fn restart_is_consumed_locally() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let mut stream = fake_worker(&mut sup, 300);
        sup.set_run_worker(false);

        sup.handle().send_event(Event::Restart, Vec::new());
        sup.handle().send_event(Event::Drain, b"1".to_vec());
        pump_until(&mut sup, Duration::from_millis(100), |_| false);

        assert!(sup.worker().run_worker);
        assert_eq!(read_message(&mut stream).unwrap().as_event(), Some(Event::Drain));
    }

    #[test]
    fn bounce_is_delivered_as_shutdown_and_keeps_auto_restart() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let mut stream = fake_worker(&mut sup, 400);
        sup.set_run_worker(true);
        // Keep housekeeping from spawning the nonexistent binary.
        sup.worker.recoverable = false;

        sup.handle().send_event(Event::Bounce, Vec::new());
        pump_until(&mut sup, Duration::from_millis(100), |_| false);
        assert_eq!(read_message(&mut stream).unwrap().as_event(), Some(Event::Shutdown));
        assert_eq!(sup.worker_state(), WorkerState::ShuttingDown);
        assert!(sup.worker().run_worker);

        drop(stream);
        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker_state() == WorkerState::Idle));
        assert!(!sup.alarms().is_current(AlarmKind::ProcessDied, None));
    }

    #[test]
    fn shutdown_disarms_auto_restart() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let mut stream = fake_worker(&mut sup, 500);
        sup.set_run_worker(true);
        sup.worker.recoverable = false;

        sup.send_event(Event::Shutdown, &[]).unwrap();
        pump_until(&mut sup, Duration::from_millis(100), |_| false);
        assert_eq!(read_message(&mut stream).unwrap().as_event(), Some(Event::Shutdown));
        assert!(!sup.worker().run_worker);
    }

    #[test]
    fn unknown_config_key_update_is_dropped() {
        let dir = TempDir::new().unwrap();
        let cfg_file = dir.path().join("records.config");
        fs::write(&cfg_file, "").unwrap();
        let ctx = Context::default();
        ctx.configs.add_file(&cfg_file, "proxy.config.records", true, false).unwrap();

        let mut sup = Supervisor::new(config(&dir), ctx).expect("sup");
        let mut stream = fake_worker(&mut sup, 600);
        let handle = sup.handle();
        handle.send_event(Event::ConfigFileUpdate, b"proxy.config.bogus".to_vec());
        handle.send_event(Event::ConfigFileUpdate, b"proxy.config.records".to_vec());
        pump_until(&mut sup, Duration::from_millis(100), |_| false);

        let msg = read_message(&mut stream).unwrap();
        assert_eq!(msg.text(), "proxy.config.records");
    }

    #[test]
    fn config_changes_are_forwarded() {
        let dir = TempDir::new().unwrap();
        let cfg_file = dir.path().join("remap.config");
        fs::write(&cfg_file, "").unwrap();
        let ctx = Context::default();
        ctx.configs.add_file(&cfg_file, "proxy.config.remap", true, false).unwrap();

        let mut sup = Supervisor::new(config(&dir), ctx).expect("sup");
        sup.forward_config_changes();
        let mut stream = fake_worker(&mut sup, 650);
        sup.configs().file_changed(&cfg_file).unwrap();
        pump_until(&mut sup, Duration::from_millis(100), |_| false);

        let msg = read_message(&mut stream).unwrap();
        assert_eq!(msg.as_event(), Some(Event::ConfigFileUpdate));
        assert_eq!(msg.text(), "proxy.config.remap");
    }

    #[test]
    fn worker_that_stops_reading_does_not_block_the_loop() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.reap_timeout_s = 1;
        let ctx = Context::default();
        let mut sup = Supervisor::new(cfg, ctx.clone()).expect("sup");
        let _stream = fake_worker(&mut sup, std::process::id() as i32);

        for _ in 0..MAX_MESSAGES_PER_PASS {
            sup.handle.send_event(Event::Drain, vec![b'x'; 60 * 1024]);
        }
        let started = Instant::now();
        assert!(pump_until(&mut sup, Duration::from_secs(10), |s| s.worker_state() == WorkerState::Idle));
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(ctx.alarms.is_current(AlarmKind::SystemError, None));
        assert!(!sup.handle.events.is_empty());
        assert!(sup.conn.is_none());
    }

    // ─── Signals ────────────────────────────────────────────────────

    #[test]
    fn worker_signals_raise_alarms_and_register_children() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("remap.config");
        let child = dir.path().join("a.config");
        fs::write(&parent, "").unwrap();
        fs::write(&child, "").unwrap();
        let ctx = Context::default();
        ctx.configs.add_file(&parent, "proxy.config.remap", true, false).unwrap();

        let mut sup = Supervisor::new(config(&dir), ctx).expect("sup");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sup.register_signal_callback(Signal::ConfigError, move |p| sink.lock().push(p.to_vec()));

        let mut stream = fake_worker(&mut sup, 700);
        write_message(&mut stream, &Message::signal(Signal::ConfigError, b"bad rule".to_vec())).unwrap();
        write_message(&mut stream, &Message::signal(Signal::CacheWarning, b"slow disk".to_vec())).unwrap();
        let pair = encode_child_pair(&parent.display().to_string(), &child.display().to_string());
        write_message(&mut stream, &Message::signal(Signal::ConfigFileChild, pair)).unwrap();

        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.configs().contains(&child)));
        assert!(sup.alarms().is_current(AlarmKind::ConfigError, None));
        assert!(!sup.alarms().is_current(AlarmKind::CacheWarning, None));
        assert_eq!(*seen.lock(), vec![b"bad rule".to_vec()]);
        assert_eq!(
            sup.alarms().signal(AlarmKind::ConfigError, None, Some("bad rule")),
            Raised::Suppressed
        );
    }

    // ─── Crash handling ─────────────────────────────────────────────

    #[test]
    fn unexpected_eof_raises_process_died() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let stream = fake_worker(&mut sup, 800);
        sup.set_run_worker(true);
        sup.worker.recoverable = false;

        drop(stream);
        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker_state() == WorkerState::Idle));
        assert!(sup.alarms().is_current(AlarmKind::ProcessDied, None));
        assert_eq!(sup.worker().last_exit, Some(WorkerExit::Unknown));
        assert_eq!(sup.worker().pid, None);
    }

    #[test]
    fn protocol_error_drops_the_connection() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        let mut stream = fake_worker(&mut sup, 900);
        stream.write_all(&[0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]).unwrap();
        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker_state() == WorkerState::Idle));
        assert!(matches!(read_message(&mut stream), Err(WireError::Closed)));
    }

    #[test]
    fn missing_worker_binary_is_a_launch_error() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(&dir), Context::default()).expect("sup");
        assert!(matches!(sup.start(), Err(WatchdogError::BinaryNotFound(_))));
        assert_eq!(sup.worker_state(), WorkerState::Idle);
    }

    #[test]
    fn launch_pending_blocks_second_start() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("silent-worker");
        fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let mut cfg = config(&dir);
        cfg.worker_binary = script;
        cfg.launch_timeout_s = 0;

        let mut sup = Supervisor::new(cfg, Context::default()).expect("sup");
        let pid = sup.start().expect("spawn");
        assert_eq!(sup.worker_state(), WorkerState::Launching);
        assert!(matches!(sup.start(), Err(WatchdogError::LaunchPending)));
        assert_eq!(sup.worker().restart_count, 1);

        // Silent worker exceeds the launch timeout and is killed.
        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker_state() == WorkerState::Idle));
        assert!(!platform::is_process_alive(pid));
        assert_eq!(sup.worker().last_exit, Some(WorkerExit::Signaled(9)));
    }

    #[test]
    fn worker_dying_before_handshake_is_classified() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("failing-worker");
        fs::write(&script, "#!/bin/sh\nexit 15\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let mut cfg = config(&dir);
        cfg.worker_binary = script;
        cfg.run_worker = true;
        let ctx = Context::default();
        let mut sup = Supervisor::new(cfg, ctx.clone()).expect("sup");

        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker().last_exit.is_some()));
        assert_eq!(sup.worker().last_exit, Some(WorkerExit::Exited(15)));
        assert!(!sup.worker().recoverable);
        assert!(ctx.alarms.is_current(AlarmKind::ProcessDied, None));

        pump_until(&mut sup, Duration::from_millis(1500), |_| false);
        assert_eq!(sup.worker().restart_count, 1);
        assert_eq!(sup.worker_state(), WorkerState::Idle);
    }

    #[test]
    fn launch_timeout_backs_off_before_relaunch() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("silent-worker");
        fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let mut cfg = config(&dir);
        cfg.worker_binary = script;
        cfg.run_worker = true;
        cfg.launch_timeout_s = 0;
        let mut sup = Supervisor::new(cfg, Context::default()).expect("sup");

        assert!(pump_until(&mut sup, Duration::from_secs(5), |s| s.worker().last_exit.is_some()));
        assert_eq!(sup.worker().last_exit, Some(WorkerExit::Signaled(9)));
        assert!(sup.worker().next_launch.is_some_and(|t| t > Instant::now()));

        pump_until(&mut sup, Duration::from_millis(500), |_| false);
        assert!(sup.worker().restart_count <= 2);
    }
}
