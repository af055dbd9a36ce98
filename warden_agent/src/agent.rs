//! Worker-side agent.
//!
//! Connects to the supervisor, announces the worker PID, receives the sync
//! key, then runs a poll thread that flushes queued signals and dispatches
//! incoming events to registered callbacks.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use warden_common::bus::MessageBus;
use warden_common::consts::{MAX_MESSAGES_PER_PASS, SOCKET_NAME};
use warden_common::message::{Event, Message, Signal};
use warden_common::wire::{read_message, write_message, WireError};

/// Agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// `start` called twice.
    #[error("agent already started")]
    AlreadyStarted,

    /// Connecting to the supervisor socket failed.
    #[error("cannot connect to supervisor at {path}: {source}")]
    Connect {
        /// Socket path.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// PID announcement or sync-key exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] WireError),

    /// The supervisor answered the announcement with something else.
    #[error("expected sync key, got message type {0}")]
    UnexpectedReply(i32),

    /// The supervisor connection went away.
    #[error("lost supervisor: {0}")]
    SupervisorLost(#[source] WireError),

    /// The supervisor sent a malformed frame.
    #[error("protocol error: {0}")]
    Protocol(#[source] WireError),

    /// Socket setup or poll thread creation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Handler invoked once when the poll loop dies.
pub type FatalHandler = Arc<dyn Fn(&AgentError) + Send + Sync>;

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding the supervisor socket.
    pub runtime_dir: PathBuf,
    /// Run without a supervisor connection.
    pub standalone: bool,
    /// Bound on each multiplex wait.
    pub poll_timeout: Duration,
    /// Bound on the sync-key reply.
    pub handshake_timeout: Duration,
}

impl AgentConfig {
    /// Connected agent for `runtime_dir`.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            standalone: false,
            poll_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Agent without a supervisor.
    pub fn standalone() -> Self {
        Self {
            standalone: true,
            ..Self::new(PathBuf::new())
        }
    }

    /// Supervisor socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(SOCKET_NAME)
    }
}

/// Connection from a worker process to its supervisor.
pub struct Agent {
    config: AgentConfig,
    events: Arc<MessageBus>,
    outbound: Arc<MessageBus>,
    running: Arc<AtomicBool>,
    sync_key: Mutex<Option<i32>>,
    fatal: Arc<Mutex<Option<FatalHandler>>>,
    socket: Mutex<Option<UnixStream>>,
    wake: Mutex<Option<UnixStream>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("sync_key", &self.sync_key())
            .field("queued", &self.outbound.len())
            .finish()
    }
}

impl Agent {
    /// Agent that is not yet started.
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            events: Arc::new(MessageBus::new()),
            outbound: Arc::new(MessageBus::new()),
            running: Arc::new(AtomicBool::new(false)),
            sync_key: Mutex::new(None),
            fatal: Arc::new(Mutex::new(None)),
            socket: Mutex::new(None),
            wake: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Register a callback for a supervisor event. Runs on the poll thread.
    pub fn register_callback<F>(&self, event: Event, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.events.register(event.id(), callback);
    }

    /// Set the handler called when the connection dies or misbehaves.
    pub fn set_fatal_handler<F>(&self, handler: F)
    where
        F: Fn(&AgentError) + Send + Sync + 'static,
    {
        *self.fatal.lock() = Some(Arc::new(handler));
    }

    /// Connect, hand over the PID, read the sync key, and start the poll
    /// thread.
    ///
    /// # Errors
    ///
    /// Any connection or handshake failure. The agent stays stopped.
    pub fn start(&self) -> Result<(), AgentError> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(AgentError::AlreadyStarted);
        }

        let conn = if self.config.standalone {
            info!("agent running standalone");
            None
        } else {
            let conn = self.connect()?;
            *self.socket.lock() = Some(conn.try_clone()?);
            Some(conn)
        };

        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;
        *self.wake.lock() = Some(wake_tx);

        self.running.store(true, Ordering::SeqCst);
        let worker = PollLoop {
            conn,
            wake: wake_rx,
            events: Arc::clone(&self.events),
            outbound: Arc::clone(&self.outbound),
            running: Arc::clone(&self.running),
            fatal: Arc::clone(&self.fatal),
            timeout: self.config.poll_timeout,
        };
        let handle = thread::Builder::new()
            .name("warden-agent".into())
            .spawn(move || worker.run())
            .inspect_err(|_| self.running.store(false, Ordering::SeqCst))?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the poll thread. Safe to call repeatedly, after a failed
    /// `start`, and from inside a callback.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.wake();
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Called from the poll thread; it exits once the callback returns.
            debug!("agent stop requested from its own poll thread");
            return;
        }
        if handle.join().is_err() {
            error!("agent poll thread panicked");
        }
        debug!("agent stopped");
    }

    /// Queue a signal for the supervisor. Order is preserved.
    pub fn signal(&self, signal: Signal, payload: impl Into<Vec<u8>>) {
        self.outbound.enqueue(Message::signal(signal, payload));
        self.wake();
    }

    /// Sync key received during the handshake.
    pub fn sync_key(&self) -> Option<i32> {
        *self.sync_key.lock()
    }

    /// Poll thread is live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        if let Some(wake) = self.wake.lock().as_ref() {
            match (&*wake).write(&[1]) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => debug!("wake write failed: {e}"),
            }
        }
    }

    fn connect(&self) -> Result<UnixStream, AgentError> {
        let path = self.config.socket_path();
        let mut conn = UnixStream::connect(&path).map_err(|source| AgentError::Connect {
            path: path.clone(),
            source,
        })?;

        let pid = std::process::id() as i32;
        write_message(&mut conn, &Message::with_i32(Signal::Pid.id(), pid))
            .map_err(AgentError::Handshake)?;

        conn.set_read_timeout(Some(self.config.handshake_timeout))?;
        let reply = read_message(&mut conn).map_err(AgentError::Handshake)?;
        if reply.as_event() != Some(Event::SyncKey) {
            return Err(AgentError::UnexpectedReply(reply.msg_type));
        }
        *self.sync_key.lock() = reply.as_i32();

        info!(pid, socket = %path.display(), sync_key = ?reply.as_i32(), "connected to supervisor");
        Ok(conn)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the poll thread.
struct PollLoop {
    conn: Option<UnixStream>,
    wake: UnixStream,
    events: Arc<MessageBus>,
    outbound: Arc<MessageBus>,
    running: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<FatalHandler>>>,
    timeout: Duration,
}

impl PollLoop {
    fn run(mut self) {
        debug!("agent poll loop started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.pass() {
                if self.running.swap(false, Ordering::SeqCst) {
                    error!("agent loop failed: {e}");
                    let handler = self.fatal.lock().clone();
                    if let Some(handler) = handler {
                        handler(&e);
                    }
                }
                break;
            }
        }
        debug!("agent poll loop exited");
    }

    fn pass(&mut self) -> Result<(), AgentError> {
        self.flush()?;

        let timeout = PollTimeout::from(self.timeout.as_millis().min(u128::from(u16::MAX)) as u16);
        let (wake_ready, conn_ready) = {
            let mut fds = vec![PollFd::new(self.wake.as_fd(), PollFlags::POLLIN)];
            if let Some(conn) = &self.conn {
                fds.push(PollFd::new(conn.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(AgentError::Io(e.into())),
            }
            (is_ready(&fds[0]), fds.get(1).is_some_and(is_ready))
        };

        if wake_ready {
            let mut buf = [0u8; 64];
            while matches!(self.wake.read(&mut buf), Ok(n) if n > 0) {}
        }
        if conn_ready && self.running.load(Ordering::SeqCst) {
            self.read_frames()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AgentError> {
        let batch = self.outbound.drain(MAX_MESSAGES_PER_PASS);
        let Some(conn) = self.conn.as_mut() else {
            if !batch.is_empty() {
                debug!(count = batch.len(), "standalone: signals discarded");
            }
            return Ok(());
        };
        for msg in batch {
            write_message(conn, &msg).map_err(classify)?;
            debug!(msg_type = msg.msg_type, len = msg.payload.len(), "signal sent");
        }
        Ok(())
    }

    fn read_frames(&mut self) -> Result<(), AgentError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        for _ in 0..MAX_MESSAGES_PER_PASS {
            let msg = read_message(conn).map_err(classify)?;
            if msg.as_event().is_none() {
                warn!(msg_type = msg.msg_type, "unknown event id");
            }
            self.events.dispatch(&msg);

            let mut fds = [PollFd::new(conn.as_fd(), PollFlags::POLLIN)];
            let more = matches!(poll(&mut fds, PollTimeout::from(0u16)), Ok(n) if n > 0)
                && is_ready(&fds[0]);
            if !more {
                break;
            }
        }
        Ok(())
    }
}

fn classify(err: WireError) -> AgentError {
    if err.is_disconnect() {
        AgentError::SupervisorLost(err)
    } else {
        AgentError::Protocol(err)
    }
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}
