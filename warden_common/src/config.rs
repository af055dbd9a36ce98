//! `warden.toml`: supervisor, alarm and watched-file settings.
//!
//! Every section except `[shared]` may be omitted; missing sections and
//! fields take the defaults below.
//!
//! # Usage
//!
//! ```rust,no_run
//! use warden_common::config::{ConfigError, ConfigLoader, WardenConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = WardenConfig::load(Path::new("warden.toml"))?;
//!     config.validate()?;
//!     println!("socket: {}", config.supervisor.socket_path().display());
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consts::{
    DEFAULT_RUNTIME_DIR, DEFAULT_SCRIPT_RUNTIME_S, DEFAULT_SYNC_KEY, SOCKET_NAME,
};

/// Why `warden.toml` could not be used.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("no configuration file at {0}")]
    FileNotFound(PathBuf),

    /// Unreadable file, bad TOML, or an unknown key.
    #[error("cannot parse configuration: {0}")]
    ParseError(String),

    /// Parsed, but the values contradict each other.
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Default log verbosity, written in lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-frame protocol chatter.
    Trace,
    /// Queue and dispatch details.
    Debug,
    /// Lifecycle: launches, exits, reloads.
    #[default]
    Info,
    /// Degraded paths only.
    Warn,
    /// Failures only.
    Error,
}

/// `[shared]` section.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "warden-edge-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Default verbosity; `-v` and `RUST_LOG` override it.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Name used in logs and alarm texts.
    pub service_name: String,
}

impl SharedConfig {
    /// Reject a blank service name.
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` when `service_name` is empty or
    /// whitespace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "shared.service_name must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[supervisor]` section: worker launch and poll-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Directory holding the listening socket.
    pub runtime_dir: PathBuf,
    /// Absolute path of the worker binary.
    pub worker_binary: PathBuf,
    /// Extra arguments passed to the worker.
    pub worker_args: Vec<String>,
    /// Keep a worker running (auto-launch and relaunch).
    pub run_worker: bool,
    /// Multiplex wait bound in milliseconds.
    pub poll_timeout_ms: u64,
    /// A launched worker must announce its PID within this many seconds.
    pub launch_timeout_s: u64,
    /// Grace period when reaping an exiting worker.
    pub reap_timeout_s: u64,
    /// Ceiling of the relaunch backoff.
    pub max_relaunch_backoff_s: u64,
    /// Key sent to the worker right after it connects.
    pub sync_key: i32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            worker_binary: PathBuf::from("/usr/bin/warden_worker"),
            worker_args: Vec::new(),
            run_worker: true,
            poll_timeout_ms: 1000,
            launch_timeout_s: 120,
            reap_timeout_s: 5,
            max_relaunch_backoff_s: 60,
            sync_key: DEFAULT_SYNC_KEY,
        }
    }
}

impl SupervisorConfig {
    /// Full path of the listening socket.
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(SOCKET_NAME)
    }

    /// Multiplex wait bound.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Launch deadline.
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_s)
    }

    /// Reap grace period.
    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_s)
    }

    /// Relaunch backoff ceiling.
    pub fn max_relaunch_backoff(&self) -> Duration {
        Duration::from_secs(self.max_relaunch_backoff_s)
    }
}

/// `[alarm]` section: external notification command.
///
/// The notification command is `abs_path/bin`. When any of the three email
/// fields is missing the command receives only the description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlarmConfig {
    /// Notification binary name.
    pub bin: Option<String>,
    /// Directory containing the notification binary.
    pub abs_path: Option<PathBuf>,
    /// Upper bound on the script runtime before it is killed.
    pub script_runtime_s: u64,
    /// Sender display name.
    pub email_from_name: Option<String>,
    /// Sender address.
    pub email_from_addr: Option<String>,
    /// Recipient address.
    pub email_to_addr: Option<String>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            bin: None,
            abs_path: None,
            script_runtime_s: DEFAULT_SCRIPT_RUNTIME_S,
            email_from_name: None,
            email_from_addr: None,
            email_to_addr: None,
        }
    }
}

impl AlarmConfig {
    /// Full path of the notification command, if configured.
    pub fn script_path(&self) -> Option<PathBuf> {
        match (&self.abs_path, &self.bin) {
            (Some(dir), Some(bin)) if !bin.is_empty() => Some(dir.join(bin)),
            _ => None,
        }
    }

    /// Script runtime bound.
    pub fn script_runtime(&self) -> Duration {
        Duration::from_secs(self.script_runtime_s)
    }

    /// Sender name, sender address and recipient, when all three are set.
    pub fn email(&self) -> Option<(&str, &str, &str)> {
        match (
            &self.email_from_name,
            &self.email_from_addr,
            &self.email_to_addr,
        ) {
            (Some(name), Some(from), Some(to)) => Some((name, from, to)),
            _ => None,
        }
    }
}

/// One `[[config_files]]` entry: a watched file and its logical key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileEntry {
    /// File path.
    pub path: PathBuf,
    /// Logical configuration key reported to change callbacks.
    pub key: String,
    /// Startup fails when a required file is missing.
    #[serde(default)]
    pub required: bool,
    /// File is only readable with elevated privileges.
    #[serde(default)]
    pub root_access: bool,
    /// Parent file this one is derived from.
    #[serde(default)]
    pub parent: Option<PathBuf>,
}

/// Complete supervisor configuration (`warden.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    /// Shared logging / identity fields.
    pub shared: SharedConfig,
    /// Worker supervision.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Alarm notification.
    #[serde(default)]
    pub alarm: AlarmConfig,
    /// Watched configuration files.
    #[serde(default)]
    pub config_files: Vec<ConfigFileEntry>,
}

impl WardenConfig {
    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `shared.service_name` is empty
    /// - `supervisor.poll_timeout_ms` is zero
    /// - a config file names a parent that is not declared
    /// - a config file names a parent that itself has a parent
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.supervisor.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.poll_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let declared: HashMap<&Path, &ConfigFileEntry> = self
            .config_files
            .iter()
            .map(|entry| (entry.path.as_path(), entry))
            .collect();

        for entry in &self.config_files {
            let Some(parent) = entry.parent.as_deref() else {
                continue;
            };
            match declared.get(parent) {
                None => {
                    return Err(ConfigError::ValidationError(format!(
                        "{}: parent {} is not declared",
                        entry.path.display(),
                        parent.display()
                    )));
                }
                Some(parent_entry) if parent_entry.parent.is_some() => {
                    return Err(ConfigError::ValidationError(format!(
                        "{}: parent {} is itself a child",
                        entry.path.display(),
                        parent.display()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// `T::load(path)` for any deserialisable `T`. Does not validate.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Read and parse `path`.
    ///
    /// # Errors
    ///
    /// `FileNotFound` for a missing file, `ParseError` for anything else.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(ConfigError::ParseError(format!("{}: {e}", path.display())));
            }
        };
        toml::from_str(&text)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn minimal() -> WardenConfig {
        toml::from_str(
            r#"
[shared]
service_name = "warden-test"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_shared_section_log_level() {
        let config: WardenConfig = toml::from_str(
            "[shared]\nservice_name = \"edge\"\nlog_level = \"warn\"\n",
        )
        .unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Warn);
        assert_eq!(minimal().shared.log_level, LogLevel::Info);
        assert!(toml::from_str::<WardenConfig>(
            "[shared]\nservice_name = \"edge\"\nlog_level = \"WARN\"\n"
        )
        .is_err());
    }

    #[test]
    fn test_blank_service_name_rejected() {
        let mut config = minimal();
        config.shared.service_name = "   ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert!(config.supervisor.run_worker);
        assert_eq!(config.supervisor.poll_timeout(), Duration::from_secs(1));
        assert_eq!(
            config.supervisor.socket_path(),
            PathBuf::from(DEFAULT_RUNTIME_DIR).join(SOCKET_NAME)
        );
        assert_eq!(config.alarm.script_runtime_s, DEFAULT_SCRIPT_RUNTIME_S);
        assert!(config.alarm.script_path().is_none());
        assert!(config.config_files.is_empty());
    }

    #[test]
    fn test_zero_poll_timeout_rejected() {
        let mut config = minimal();
        config.supervisor.poll_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_undeclared_parent_rejected() {
        let config: WardenConfig = toml::from_str(
            r#"
[shared]
service_name = "warden-test"

[[config_files]]
path = "/etc/warden/remap.d/a.config"
key = "proxy.config.remap"
parent = "/etc/warden/remap.config"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not declared"), "{err}");
    }

    #[test]
    fn test_grandchild_rejected() {
        let config: WardenConfig = toml::from_str(
            r#"
[shared]
service_name = "warden-test"

[[config_files]]
path = "/a"
key = "k"

[[config_files]]
path = "/b"
key = "k"
parent = "/a"

[[config_files]]
path = "/c"
key = "k"
parent = "/b"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("itself a child"), "{err}");
    }

    #[test]
    fn test_alarm_email_requires_all_three() {
        let mut alarm = AlarmConfig {
            email_from_name: Some("warden".into()),
            email_from_addr: Some("ops@example.com".into()),
            ..AlarmConfig::default()
        };
        assert!(alarm.email().is_none());
        alarm.email_to_addr = Some("oncall@example.com".into());
        assert_eq!(
            alarm.email(),
            Some(("warden", "ops@example.com", "oncall@example.com"))
        );
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = WardenConfig::load(Path::new("/nonexistent/path/warden.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = WardenConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_supervisor_field_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[shared]
service_name = "warden-test"

[supervisor]
poll_timeout_msec = 10
"#
        )
        .unwrap();
        file.flush().unwrap();

        assert!(matches!(
            WardenConfig::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
