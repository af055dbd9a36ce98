//! Warden Common Library
//!
//! Shared vocabulary for the supervisor (`warden`) and the worker-side
//! agent (`warden_agent`).
//!
//! # Module Structure
//!
//! - [`consts`] - Protocol limits and well-known names
//! - [`config`] - Configuration loading traits and types
//! - [`message`] - Event and signal ids, the `Message` type
//! - [`wire`] - Length-prefixed framing
//! - [`bus`] - Thread-safe message queue with callback dispatch
//! - [`watchdog`] - Worker lifecycle contract
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use warden_common::prelude::*;
//!
//! let bus = MessageBus::new();
//! bus.enqueue(Message::event(Event::RollLogFiles, Vec::new()));
//! assert_eq!(bus.len(), 1);
//! ```

#![deny(missing_docs)]

pub mod bus;
pub mod config;
pub mod consts;
pub mod message;
pub mod prelude;
pub mod watchdog;
pub mod wire;
