//! Modification-time tracking for a single configuration file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Whether a staleness check records the new modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Report only.
    CheckOnly,
    /// Report and remember the new mtime.
    CheckAndUpdate,
}

/// One watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWatcher {
    path: PathBuf,
    config_key: String,
    last_modified: SystemTime,
    required: bool,
    root_access_needed: bool,
    parent: Option<PathBuf>,
}

impl ConfigWatcher {
    /// Start watching `path`. If the file cannot be stat'ed yet, the
    /// baseline is "now" so only a later write counts as a change.
    pub fn new(
        path: impl Into<PathBuf>,
        config_key: impl Into<String>,
        required: bool,
        root_access_needed: bool,
    ) -> Self {
        let path = path.into();
        let last_modified = modified(&path).unwrap_or_else(|_| SystemTime::now());
        Self {
            path,
            config_key: config_key.into(),
            last_modified,
            required,
            root_access_needed,
            parent: None,
        }
    }

    /// Watcher for a file included by `self`, inheriting key and flags.
    pub fn child(&self, path: impl Into<PathBuf>) -> Self {
        let mut child = Self::new(path, self.config_key.clone(), self.required, self.root_access_needed);
        child.parent = Some(self.path.clone());
        child
    }

    /// Stale when the stored mtime is older than the file's current mtime.
    /// A failed stat is never stale.
    pub fn check_for_update(&mut self, mode: CheckMode) -> bool {
        let current = match modified(&self.path) {
            Ok(mtime) => mtime,
            Err(e) => {
                debug!(path = %self.path.display(), "stat failed: {e}");
                return false;
            }
        };
        if self.last_modified >= current {
            return false;
        }
        if mode == CheckMode::CheckAndUpdate {
            self.last_modified = current;
        }
        true
    }

    /// Watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical configuration key.
    pub fn config_key(&self) -> &str {
        &self.config_key
    }

    /// Stored modification time.
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Missing file is fatal at startup.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Needs elevated privileges to read.
    pub fn root_access_needed(&self) -> bool {
        self.root_access_needed
    }

    /// Parent file, for included files.
    pub fn parent(&self) -> Option<&Path> {
        self.parent.as_deref()
    }

    /// Has a parent.
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }
}

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}
