//! Prelude module for common re-exports.
//!
//! ```rust
//! use warden_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    AlarmConfig, ConfigError, ConfigFileEntry, ConfigLoader, LogLevel, SharedConfig,
    SupervisorConfig, WardenConfig,
};

// ─── Messaging ──────────────────────────────────────────────────────
pub use crate::bus::MessageBus;
pub use crate::message::{Event, Message, Signal};
pub use crate::wire::{read_message, write_message, WireError};

// ─── Supervision ────────────────────────────────────────────────────
pub use crate::watchdog::{Watchdog, WatchdogError, WorkerExit, WorkerState};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{MAX_PAYLOAD_LEN, RUNTIME_DIR_ENV, SOCKET_NAME};
