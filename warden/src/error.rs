//! Supervisor error type.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use warden_common::config::ConfigError;
use warden_common::watchdog::WatchdogError;
use warden_common::wire::WireError;

use crate::registry::RegistryError;

/// Errors surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Another supervisor answers on the socket path.
    #[error("another supervisor is already listening on {0}")]
    AlreadyRunning(PathBuf),

    /// Creating the listening socket failed.
    #[error("cannot bind {path}: {source}")]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A watched file could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Worker lifecycle failure.
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    /// Framing failure on the worker connection.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Multiplexed wait failed.
    #[error("poll failed: {0}")]
    Poll(#[from] nix::Error),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
