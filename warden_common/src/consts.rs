//! System-wide constants for the warden workspace.
//!
//! Single source of truth for protocol limits, well-known names and
//! default paths. Imported by the supervisor and the agent alike.

use std::time::Duration;

/// File name of the supervisor's listening socket inside the runtime directory.
pub const SOCKET_NAME: &str = "warden.sock";

/// Environment variable through which the supervisor tells the worker
/// where its runtime directory is.
pub const RUNTIME_DIR_ENV: &str = "WARDEN_RUNTIME_DIR";

/// Default runtime directory.
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run/warden";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/warden.toml";

/// Largest payload a sender may put on the wire (64 KiB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Upper bound on frames read (or queued messages written) per poll pass.
pub const MAX_MESSAGES_PER_PASS: usize = 64;

/// Worker exit status meaning "do not restart me".
pub const UNRECOVERABLE_EXIT: i32 = 15;

/// Sync key handed to the worker when no key is configured.
pub const DEFAULT_SYNC_KEY: i32 = 11452;

/// Window during which an identical local alarm description is suppressed.
pub const ALARM_REPEAT_WINDOW: Duration = Duration::from_secs(900);

/// Default bound on the alarm notification script's runtime.
pub const DEFAULT_SCRIPT_RUNTIME_S: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(MAX_PAYLOAD_LEN > 0 && MAX_PAYLOAD_LEN <= i32::MAX as usize);
        assert!(MAX_MESSAGES_PER_PASS > 0);
        assert_ne!(UNRECOVERABLE_EXIT, 0);
        assert!(DEFAULT_SYNC_KEY > 0);
    }

    #[test]
    fn repeat_window_is_fifteen_minutes() {
        assert_eq!(ALARM_REPEAT_WINDOW.as_secs(), 15 * 60);
    }

    #[test]
    fn socket_name_is_a_bare_file_name() {
        assert!(!SOCKET_NAME.contains('/'));
    }
}
