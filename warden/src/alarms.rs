//! Alarm center: deduplicated, prioritised operator alarms.
//!
//! Local alarms are keyed by kind; remote alarms by `(kind, peer)`. At most
//! one live record exists per key. Raising an alarm may run the external
//! notification command and always informs registered callbacks when a
//! record is created.

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use warden_common::config::AlarmConfig;
use warden_common::consts::ALARM_REPEAT_WINDOW;

use crate::platform::{self, Reaped};

/// Alarm kinds known to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlarmKind {
    /// Worker process died unexpectedly.
    ProcessDied,
    /// Worker process started.
    ProcessBorn,
    /// A cluster peer appeared.
    PeerBorn,
    /// A cluster peer went away.
    PeerDied,
    /// Invalid configuration.
    ConfigError,
    /// Generic system failure.
    SystemError,
    /// Log partition nearly full.
    LogSpaceCrisis,
    /// Cache subsystem error.
    CacheError,
    /// Cache subsystem warning.
    CacheWarning,
    /// Logging subsystem error.
    LoggingError,
    /// Logging subsystem warning.
    LoggingWarning,
    /// Applying a configuration change failed.
    ConfigUpdateFailed,
    /// Management web interface failure.
    WebError,
    /// Health ping to a peer failed.
    PingFailure,
    /// Billing connection lost.
    BillingConnectionDied,
    /// Billing stream carried corrupted records.
    BillingCorruptedData,
    /// Transformation engine is down.
    XfEngineDown,
    /// RADIUS packets failed validation.
    RadiusCorruptedPackets,
}

/// Kinds that bypass the repeat window and refresh their record on every
/// signal.
pub const REPEAT_EXEMPT: [AlarmKind; 4] = [
    AlarmKind::BillingConnectionDied,
    AlarmKind::BillingCorruptedData,
    AlarmKind::XfEngineDown,
    AlarmKind::RadiusCorruptedPackets,
];

/// Alarm priority. Lower number is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Notify on every occurrence.
    Critical = 1,
    /// Notify on first occurrence.
    Major = 2,
    /// Record only.
    Minor = 3,
}

/// What the center does with a kind before any bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dropped without a trace beyond a debug log.
    Suppressed,
    /// Logged, never recorded.
    Informational,
    /// Recorded at the given priority.
    Record(Priority),
}

impl AlarmKind {
    /// Priority table.
    pub const fn disposition(self) -> Disposition {
        match self {
            AlarmKind::CacheWarning => Disposition::Suppressed,
            AlarmKind::ProcessBorn => Disposition::Informational,
            AlarmKind::CacheError | AlarmKind::ProcessDied | AlarmKind::PingFailure => {
                Disposition::Record(Priority::Critical)
            }
            AlarmKind::PeerBorn | AlarmKind::PeerDied => Disposition::Record(Priority::Minor),
            _ => Disposition::Record(Priority::Major),
        }
    }

    /// Bypasses the repeat window.
    pub fn is_repeat_exempt(self) -> bool {
        REPEAT_EXEMPT.contains(&self)
    }

    /// Description used when the caller supplies none.
    pub const fn default_text(self) -> &'static str {
        match self {
            AlarmKind::ProcessDied => "[warden] Worker process died",
            AlarmKind::ProcessBorn => "[warden] Worker process born",
            AlarmKind::PeerBorn => "[warden] Peer born",
            AlarmKind::PeerDied => "[warden] Peer died",
            AlarmKind::ConfigError => "[warden] Configuration error",
            AlarmKind::SystemError => "[warden] System error",
            AlarmKind::LogSpaceCrisis => "[warden] Log space crisis",
            AlarmKind::CacheError => "[warden] Cache error",
            AlarmKind::CacheWarning => "[warden] Cache warning",
            AlarmKind::LoggingError => "[warden] Logging error",
            AlarmKind::LoggingWarning => "[warden] Logging warning",
            AlarmKind::ConfigUpdateFailed => "[warden] Configuration update failed",
            AlarmKind::WebError => "[warden] Management web interface error",
            AlarmKind::PingFailure => "[warden] Ping failure",
            AlarmKind::BillingConnectionDied => "[warden] Billing connection died",
            AlarmKind::BillingCorruptedData => "[warden] Billing corrupted data",
            AlarmKind::XfEngineDown => "[warden] Transformation engine down",
            AlarmKind::RadiusCorruptedPackets => "[warden] RADIUS corrupted packets",
        }
    }
}

impl std::fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A live alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRecord {
    /// Alarm kind.
    pub kind: AlarmKind,
    /// Priority at creation.
    pub priority: Priority,
    /// Raised on behalf of a peer.
    pub is_remote: bool,
    /// Peer address for remote alarms.
    pub peer: Option<String>,
    /// Timestamped description.
    pub description: Option<String>,
    /// Re-reported since the last `reset_seen`.
    pub seen: bool,
    /// Stays until explicitly resolved.
    pub linger: bool,
}

/// What [`AlarmCenter::signal`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raised {
    /// Kind is suppressed, or the description repeated inside the window
    /// while the record is still live.
    Suppressed,
    /// Kind is informational; logged only.
    Informational,
    /// A new record was created.
    Created,
    /// A resolved record was recreated inside the repeat window; no
    /// notification was sent.
    Muted,
    /// Existing record of a repeat-exempt kind got a fresh description.
    Refreshed,
    /// Existing remote record marked seen.
    Seen,
    /// Existing local record left untouched.
    Existing,
}

/// External notification seam.
pub trait Notifier: Send + Sync {
    /// Deliver one alarm description. Must return within a bounded time.
    fn notify(&self, description: &str);
}

/// Runs the configured notification command.
#[derive(Debug, Clone)]
pub struct ScriptNotifier {
    path: PathBuf,
    email: Option<(String, String, String)>,
    runtime: Duration,
}

impl ScriptNotifier {
    /// Notifier for an explicit command path.
    pub fn new(path: impl Into<PathBuf>, runtime: Duration) -> Self {
        Self {
            path: path.into(),
            email: None,
            runtime,
        }
    }

    /// Pass sender name, sender address and recipient after the description.
    pub fn with_email(mut self, from_name: &str, from_addr: &str, to_addr: &str) -> Self {
        self.email = Some((from_name.into(), from_addr.into(), to_addr.into()));
        self
    }

    /// Build from the `[alarm]` section; `None` when no command is configured.
    pub fn from_config(config: &AlarmConfig) -> Option<Self> {
        let path = config.script_path()?;
        let notifier = Self::new(path, config.script_runtime());
        Some(match config.email() {
            Some((name, from, to)) => notifier.with_email(name, from, to),
            None => notifier,
        })
    }
}

impl Notifier for ScriptNotifier {
    fn notify(&self, description: &str) {
        if !platform::is_executable(&self.path) {
            debug!(path = %self.path.display(), "alarm command missing or not executable; skipped");
            return;
        }

        let mut cmd = Command::new(&self.path);
        cmd.arg(description)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some((name, from, to)) = &self.email {
            cmd.args([name, from, to]);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(path = %self.path.display(), "cannot run alarm command: {e}");
                return;
            }
        };
        match platform::wait_with_deadline(child, self.runtime) {
            Reaped::Exited(status) if !status.success() => {
                debug!(path = %self.path.display(), "alarm command {status}");
            }
            Reaped::Exited(_) => {}
            Reaped::Killed(_) => {
                warn!(path = %self.path.display(), "alarm command exceeded {:?}; killed", self.runtime);
            }
        }
    }
}

/// Callback receiving `(kind, peer, description)` for new or refreshed records.
pub type AlarmCallback = Arc<dyn Fn(AlarmKind, Option<&str>, &str) + Send + Sync>;

#[derive(Default)]
struct AlarmState {
    local: HashMap<AlarmKind, AlarmRecord>,
    remote: HashMap<(AlarmKind, String), AlarmRecord>,
    prev_text: Option<String>,
    last_sent: Option<Instant>,
}

/// Alarm registry shared across threads.
pub struct AlarmCenter {
    state: Mutex<AlarmState>,
    callbacks: RwLock<Vec<AlarmCallback>>,
    notifier: Option<Arc<dyn Notifier>>,
    repeat_window: Duration,
}

impl std::fmt::Debug for AlarmCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AlarmCenter")
            .field("local", &state.local.len())
            .field("remote", &state.remote.len())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl AlarmCenter {
    /// Empty center with an optional notifier.
    pub fn new(notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            state: Mutex::new(AlarmState::default()),
            callbacks: RwLock::new(Vec::new()),
            notifier,
            repeat_window: ALARM_REPEAT_WINDOW,
        }
    }

    /// Center wired to the `[alarm]` notification command.
    pub fn from_config(config: &AlarmConfig) -> Self {
        let notifier = ScriptNotifier::from_config(config).map(|n| Arc::new(n) as Arc<dyn Notifier>);
        Self::new(notifier)
    }

    /// Override the repeat window.
    pub fn with_repeat_window(mut self, window: Duration) -> Self {
        self.repeat_window = window;
        self
    }

    /// Register a callback for created and refreshed records.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(AlarmKind, Option<&str>, &str) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Raise an alarm. `peer` is `None` for local alarms.
    pub fn signal(&self, kind: AlarmKind, peer: Option<&str>, desc: Option<&str>) -> Raised {
        let priority = match kind.disposition() {
            Disposition::Suppressed => {
                debug!(%kind, "suppressed alarm kind");
                return Raised::Suppressed;
            }
            Disposition::Informational => {
                info!(%kind, "{}", desc.unwrap_or(kind.default_text()));
                return Raised::Informational;
            }
            Disposition::Record(priority) => priority,
        };
        let local = peer.is_none();
        let exempt = kind.is_repeat_exempt();
        let text = desc.unwrap_or(kind.default_text());

        let muted = local
            && priority <= Priority::Major
            && desc.is_some_and(|desc| self.is_repeat(desc, exempt));
        if muted && self.is_current(kind, None) {
            debug!(%kind, "repeated alarm text inside window; suppressed");
            return Raised::Suppressed;
        }

        if local && priority == Priority::Critical && !muted {
            self.notify(text);
        }

        let stamped = format!("[{}] {}", ctime_now(), text);
        let outcome = {
            let mut state = self.state.lock();
            match peer {
                Some(peer) => {
                    let key = (kind, peer.to_string());
                    if let Some(record) = state.remote.get_mut(&key) {
                        record.seen = true;
                        return Raised::Seen;
                    }
                    state
                        .remote
                        .insert(key, new_record(kind, priority, Some(peer), &stamped));
                    Raised::Created
                }
                None => match state.local.get_mut(&kind) {
                    Some(record) if exempt => {
                        record.description = Some(stamped.clone());
                        Raised::Refreshed
                    }
                    Some(_) => return Raised::Existing,
                    None => {
                        state
                            .local
                            .insert(kind, new_record(kind, priority, None, &stamped));
                        if muted { Raised::Muted } else { Raised::Created }
                    }
                },
            }
        };

        if outcome == Raised::Created {
            match peer {
                Some(peer) => info!(%kind, peer, "alarm raised: {text}"),
                None => warn!(%kind, "alarm raised: {text}"),
            }
            if local && priority == Priority::Major {
                self.notify(text);
            }
        } else if outcome == Raised::Muted {
            warn!(%kind, "alarm raised again inside repeat window: {text}");
        }
        self.run_callbacks(kind, peer, &stamped);
        outcome
    }

    /// Remove the record. Returns whether one existed; resolving twice is
    /// harmless.
    pub fn resolve(&self, kind: AlarmKind, peer: Option<&str>) -> bool {
        let mut state = self.state.lock();
        let removed = match peer {
            Some(peer) => state.remote.remove(&(kind, peer.to_string())).is_some(),
            None => state.local.remove(&kind).is_some(),
        };
        if removed {
            info!(%kind, peer = peer.unwrap_or("local"), "alarm resolved");
        }
        removed
    }

    /// Is a record live for this key.
    pub fn is_current(&self, kind: AlarmKind, peer: Option<&str>) -> bool {
        let state = self.state.lock();
        match peer {
            Some(peer) => state.remote.contains_key(&(kind, peer.to_string())),
            None => state.local.contains_key(&kind),
        }
    }

    /// Clear the `seen` flag of every remote record for `peer`.
    pub fn reset_seen(&self, peer: &str) {
        let mut state = self.state.lock();
        for ((_, p), record) in state.remote.iter_mut() {
            if p == peer {
                record.seen = false;
            }
        }
    }

    /// Delete remote records for `peer` not re-reported since `reset_seen`.
    /// Returns the number removed.
    pub fn sweep_unseen(&self, peer: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.remote.len();
        state.remote.retain(|(_, p), record| p != peer || record.seen);
        before - state.remote.len()
    }

    /// Snapshot of local records, ordered by kind.
    pub fn local_alarms(&self) -> Vec<AlarmRecord> {
        let mut out: Vec<AlarmRecord> = self.state.lock().local.values().cloned().collect();
        out.sort_by_key(|r| r.kind);
        out
    }

    /// Snapshot of remote records, ordered by peer then kind.
    pub fn remote_alarms(&self) -> Vec<AlarmRecord> {
        let mut out: Vec<AlarmRecord> = self.state.lock().remote.values().cloned().collect();
        out.sort_by(|a, b| a.peer.cmp(&b.peer).then(a.kind.cmp(&b.kind)));
        out
    }

    /// Whether `desc` repeats the last local text inside the window. Any
    /// other text restarts the window; exempt kinds restart it but never
    /// count as a repeat.
    fn is_repeat(&self, desc: &str, exempt: bool) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let within = state
            .last_sent
            .is_some_and(|t| now.duration_since(t) < self.repeat_window);
        if within && state.prev_text.as_deref() == Some(desc) {
            return !exempt;
        }
        state.prev_text = Some(desc.to_string());
        state.last_sent = Some(now);
        false
    }

    fn notify(&self, text: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(text);
        }
    }

    fn run_callbacks(&self, kind: AlarmKind, peer: Option<&str>, desc: &str) {
        let list: Vec<AlarmCallback> = self.callbacks.read().clone();
        for callback in &list {
            callback(kind, peer, desc);
        }
    }
}

fn new_record(kind: AlarmKind, priority: Priority, peer: Option<&str>, desc: &str) -> AlarmRecord {
    AlarmRecord {
        kind,
        priority,
        is_remote: peer.is_some(),
        peer: peer.map(str::to_string),
        description: Some(desc.to_string()),
        seen: true,
        linger: true,
    }
}

/// `ctime(3)`-style local timestamp, e.g. `Thu Oct 15 10:20:30 2026`.
fn ctime_now() -> String {
    Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}
