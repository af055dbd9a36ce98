//! Message vocabulary shared by the supervisor and its worker.
//!
//! Two disjoint integer ranges travel over the socket:
//!
//! - [`Event`] (10000 and up): supervisor → worker commands.
//! - [`Signal`] (0 and up): worker → supervisor reports.
//!
//! Ids are stable; their numeric values are part of the wire contract.

use std::borrow::Cow;

/// Supervisor → worker event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Event {
    /// Sync key handed to a freshly connected worker.
    SyncKey = 10000,
    /// Stop serving and exit.
    Shutdown = 10001,
    /// Re-enable worker supervision (handled by the supervisor itself).
    Restart = 10002,
    /// Restart the worker; delivered as `Shutdown`.
    Bounce = 10003,
    /// Reset statistics.
    ClearStats = 10004,
    /// A configuration key changed.
    ConfigFileUpdate = 10005,
    /// Plugin configuration changed.
    PluginConfigUpdate = 10006,
    /// Reopen log files.
    RollLogFiles = 10008,
    /// Records library passthrough.
    Librecords = 10009,
    /// Configuration change without a version bump.
    ConfigFileUpdateNoIncVersion = 10010,
    /// A storage device went offline.
    StorageDeviceOffline = 10011,
    /// Plugin lifecycle hook.
    LifecycleMessage = 10012,
    /// Start or stop draining traffic.
    Drain = 10013,
    /// Upstream host marked up.
    HostStatusUp = 10014,
    /// Upstream host marked down.
    HostStatusDown = 10015,
}

impl Event {
    /// Every event, in id order.
    pub const ALL: [Event; 15] = [
        Event::SyncKey,
        Event::Shutdown,
        Event::Restart,
        Event::Bounce,
        Event::ClearStats,
        Event::ConfigFileUpdate,
        Event::PluginConfigUpdate,
        Event::RollLogFiles,
        Event::Librecords,
        Event::ConfigFileUpdateNoIncVersion,
        Event::StorageDeviceOffline,
        Event::LifecycleMessage,
        Event::Drain,
        Event::HostStatusUp,
        Event::HostStatusDown,
    ];

    /// Wire id.
    pub const fn id(self) -> i32 {
        self as i32
    }

    /// Map a wire id back to an event.
    pub const fn from_i32(id: i32) -> Option<Self> {
        Some(match id {
            10000 => Event::SyncKey,
            10001 => Event::Shutdown,
            10002 => Event::Restart,
            10003 => Event::Bounce,
            10004 => Event::ClearStats,
            10005 => Event::ConfigFileUpdate,
            10006 => Event::PluginConfigUpdate,
            10008 => Event::RollLogFiles,
            10009 => Event::Librecords,
            10010 => Event::ConfigFileUpdateNoIncVersion,
            10011 => Event::StorageDeviceOffline,
            10012 => Event::LifecycleMessage,
            10013 => Event::Drain,
            10014 => Event::HostStatusUp,
            10015 => Event::HostStatusDown,
            _ => return None,
        })
    }
}

/// Worker → supervisor signal ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Signal {
    /// Worker announces its process id (first frame on a connection).
    Pid = 0,
    /// A child of the worker died.
    ProcessDied = 1,
    /// Worker finished starting.
    ProcessBorn = 2,
    /// Configuration error detected by the worker.
    ConfigError = 3,
    /// Generic system error.
    SystemError = 4,
    /// Log partition running out of space.
    LogSpaceCrisis = 5,
    /// Cache subsystem error.
    CacheError = 6,
    /// Cache subsystem warning.
    CacheWarning = 7,
    /// Logging subsystem error.
    LoggingError = 8,
    /// Logging subsystem warning.
    LoggingWarning = 9,
    /// Plugin asks for a configuration value to be set.
    PluginSetConfig = 10,
    /// Records library passthrough.
    Librecords = 11,
    /// Worker discovered a file included by a watched configuration file.
    ConfigFileChild = 12,
}

impl Signal {
    /// Wire id.
    pub const fn id(self) -> i32 {
        self as i32
    }

    /// Map a wire id back to a signal.
    pub const fn from_i32(id: i32) -> Option<Self> {
        Some(match id {
            0 => Signal::Pid,
            1 => Signal::ProcessDied,
            2 => Signal::ProcessBorn,
            3 => Signal::ConfigError,
            4 => Signal::SystemError,
            5 => Signal::LogSpaceCrisis,
            6 => Signal::CacheError,
            7 => Signal::CacheWarning,
            8 => Signal::LoggingError,
            9 => Signal::LoggingWarning,
            10 => Signal::PluginSetConfig,
            11 => Signal::Librecords,
            12 => Signal::ConfigFileChild,
            _ => return None,
        })
    }
}

/// A typed message: integer id plus opaque payload.
///
/// Text payloads are UTF-8 without a terminator. Integer payloads
/// (PID, sync key) are four native-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Event or signal id.
    pub msg_type: i32,
    /// Payload bytes, possibly empty.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message from a raw id.
    pub fn new(msg_type: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Supervisor → worker message.
    pub fn event(event: Event, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(event.id(), payload)
    }

    /// Worker → supervisor message.
    pub fn signal(signal: Signal, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(signal.id(), payload)
    }

    /// Message carrying a single native-endian `i32`.
    pub fn with_i32(msg_type: i32, value: i32) -> Self {
        Self::new(msg_type, value.to_ne_bytes().to_vec())
    }

    /// Payload decoded as a native-endian `i32`.
    ///
    /// Returns `None` unless the payload is exactly four bytes.
    pub fn as_i32(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.payload.as_slice().try_into().ok()?;
        Some(i32::from_ne_bytes(bytes))
    }

    /// Payload as text, with any trailing NULs dropped.
    pub fn text(&self) -> Cow<'_, str> {
        payload_text(&self.payload)
    }

    /// The id as an [`Event`], if it is one.
    pub fn as_event(&self) -> Option<Event> {
        Event::from_i32(self.msg_type)
    }

    /// The id as a [`Signal`], if it is one.
    pub fn as_signal(&self) -> Option<Signal> {
        Signal::from_i32(self.msg_type)
    }
}

/// Decode a payload as lossy UTF-8 text, ignoring trailing NULs.
pub fn payload_text(payload: &[u8]) -> Cow<'_, str> {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    String::from_utf8_lossy(&payload[..end])
}

/// Encode a `ConfigFileChild` payload: parent path, NUL, child path.
pub fn encode_child_pair(parent: &str, child: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(parent.len() + child.len() + 1);
    out.extend_from_slice(parent.as_bytes());
    out.push(0);
    out.extend_from_slice(child.as_bytes());
    out
}

/// Split a `ConfigFileChild` payload into parent and child paths.
pub fn decode_child_pair(payload: &[u8]) -> Option<(String, String)> {
    let split = payload.iter().position(|&b| b == 0)?;
    let parent = payload_text(&payload[..split]);
    let child = payload_text(&payload[split + 1..]);
    if parent.is_empty() || child.is_empty() {
        return None;
    }
    Some((parent.into_owned(), child.into_owned()))
}
