//! # Warden Supervisor Library
//!
//! Control plane for a single caching-proxy worker process: launches and
//! relaunches it, talks to it over a Unix stream socket, keeps operator
//! alarms, and tracks configuration files for changes.
//!
//! # Module Structure
//!
//! - [`supervisor`] - Listening socket, poll loop, worker state machine
//! - [`process`] - Worker launcher and supervision bookkeeping
//! - [`alarms`] - Alarm center and notification command
//! - [`registry`] - Watched configuration files and change callbacks
//! - [`watcher`] - Per-file modification tracking
//! - [`context`] - Shared services passed to every component
//! - [`platform`] - POSIX process helpers
//! - [`error`] - Supervisor error type
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         warden (supervisor)                      │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────────────┐ │
//! │  │ AlarmCenter  │◄───│  Supervisor  │───►│  ConfigRegistry     │ │
//! │  │              │    │  (poll loop) │    │  (mtime watchers)   │ │
//! │  └──────────────┘    └──────┬───────┘    └─────────────────────┘ │
//! │                             │ warden.sock                        │
//! └─────────────────────────────┼────────────────────────────────────┘
//!                               ▼
//!                    ┌────────────────────┐
//!                    │ worker + Agent     │ (warden_agent)
//!                    └────────────────────┘
//! ```

#![deny(missing_docs)]

pub mod alarms;
pub mod context;
pub mod error;
pub mod platform;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod watcher;

pub use crate::alarms::{AlarmCenter, AlarmKind, AlarmRecord};
pub use crate::context::Context;
pub use crate::error::SupervisorError;
pub use crate::registry::ConfigRegistry;
pub use crate::supervisor::{Supervisor, SupervisorHandle};
