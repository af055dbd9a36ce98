//! Registry of watched configuration files and their change callbacks.
//!
//! Files form a two-level tree: a root file may include children (reported
//! by the worker), and a child never has children of its own. When a root
//! changes its children are dropped; the worker re-reports the ones it
//! still includes after re-reading the root.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_common::config::ConfigFileEntry;

use crate::platform;
use crate::watcher::{CheckMode, ConfigWatcher};

/// Registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A required file does not exist.
    #[error("required configuration file {0} is missing")]
    MissingRequired(PathBuf),

    /// The path is not registered.
    #[error("configuration file {0} is not registered")]
    NotRegistered(PathBuf),

    /// A change callback reported failure.
    #[error("change callback for {path} failed: {reason}")]
    Callback {
        /// File whose change was being applied.
        path: PathBuf,
        /// Callback's message.
        reason: String,
    },
}

/// Change callback: `(path, config_key)`.
pub type ChangeCallback = Arc<dyn Fn(&Path, &str) -> Result<(), String> + Send + Sync>;

/// Outcome of [`ConfigRegistry::reread_config`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RereadReport {
    /// Files whose callbacks ran, in notification order.
    pub notified: Vec<PathBuf>,
    /// Children dropped because their parent changed.
    pub dropped_children: Vec<PathBuf>,
    /// Every callback failure.
    pub errors: Vec<RegistryError>,
}

impl RereadReport {
    /// No callback failed.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owning map of watched files.
#[derive(Default)]
pub struct ConfigRegistry {
    watchers: Mutex<BTreeMap<PathBuf, ConfigWatcher>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("files", &self.len())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl ConfigRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from `[[config_files]]`. Roots are added before
    /// children.
    ///
    /// # Errors
    ///
    /// Fails on the first missing required root.
    pub fn from_entries(entries: &[ConfigFileEntry]) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for entry in entries.iter().filter(|e| e.parent.is_none()) {
            registry.add_file(&entry.path, &entry.key, entry.required, entry.root_access)?;
        }
        for entry in entries {
            if let Some(parent) = &entry.parent {
                registry.config_file_child(parent, &entry.path);
            }
        }
        Ok(registry)
    }

    /// Register a root file.
    ///
    /// # Errors
    ///
    /// `MissingRequired` when `required` is set and the file does not exist.
    /// A missing optional file is registered with a warning.
    pub fn add_file(
        &self,
        path: impl AsRef<Path>,
        config_key: &str,
        required: bool,
        root_access: bool,
    ) -> Result<(), RegistryError> {
        let path = path.as_ref();
        if !platform::exists(path) {
            if required {
                return Err(RegistryError::MissingRequired(path.to_path_buf()));
            }
            warn!(path = %path.display(), "optional configuration file missing");
        }
        let watcher = ConfigWatcher::new(path, config_key, required, root_access);
        self.watchers.lock().insert(path.to_path_buf(), watcher);
        debug!(path = %path.display(), key = config_key, "watching");
        Ok(())
    }

    /// Register `child` as included by `parent`. Returns whether a new
    /// watcher was added; unknown parents, child parents and already
    /// registered paths are ignored.
    pub fn config_file_child(&self, parent: impl AsRef<Path>, child: impl AsRef<Path>) -> bool {
        let (parent, child) = (parent.as_ref(), child.as_ref());
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(child) {
            return false;
        }
        let watcher = match watchers.get(parent) {
            Some(p) if !p.is_child() => p.child(child),
            Some(_) => {
                debug!(parent = %parent.display(), "parent is itself a child; ignored");
                return false;
            }
            None => {
                debug!(parent = %parent.display(), "unknown parent; ignored");
                return false;
            }
        };
        watchers.insert(child.to_path_buf(), watcher);
        debug!(parent = %parent.display(), child = %child.display(), "watching child");
        true
    }

    /// Append a change callback. Callbacks run in registration order.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&Path, &str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Sweep every file, drop children of changed roots, and run callbacks
    /// for each changed file and for each parent of a changed child.
    pub fn reread_config(&self) -> RereadReport {
        let mut report = RereadReport::default();
        let notify: Vec<(PathBuf, String)> = {
            let mut watchers = self.watchers.lock();

            let mut changed: Vec<(PathBuf, String, Option<PathBuf>)> = Vec::new();
            for watcher in watchers.values_mut() {
                if watcher.check_for_update(CheckMode::CheckAndUpdate) {
                    changed.push((
                        watcher.path().to_path_buf(),
                        watcher.config_key().to_string(),
                        watcher.parent().map(Path::to_path_buf),
                    ));
                }
            }

            let changed_roots: Vec<&PathBuf> = changed
                .iter()
                .filter(|(_, _, parent)| parent.is_none())
                .map(|(path, _, _)| path)
                .collect();
            watchers.retain(|path, w| {
                let orphaned = w
                    .parent()
                    .is_some_and(|p| changed_roots.iter().any(|r| r.as_path() == p));
                if orphaned {
                    report.dropped_children.push(path.clone());
                }
                !orphaned
            });

            let mut notify: Vec<(PathBuf, String)> = Vec::new();
            let mut push = |path: &Path, key: &str| {
                if !notify.iter().any(|(p, _)| p == path) {
                    notify.push((path.to_path_buf(), key.to_string()));
                }
            };
            for (path, key, parent) in &changed {
                push(path, key);
                if let Some(parent) = parent {
                    let parent_changed = changed.iter().any(|(p, _, _)| p == parent);
                    if !parent_changed {
                        if let Some(pw) = watchers.get(parent) {
                            push(parent, pw.config_key());
                        }
                    }
                }
            }
            notify
        };

        for (path, key) in &notify {
            info!(path = %path.display(), key = key.as_str(), "configuration file changed");
            report.errors.extend(self.run_callbacks(path, key));
            report.notified.push(path.clone());
        }
        report
    }

    /// Any file changed since last recorded. Records nothing.
    pub fn is_config_stale(&self) -> bool {
        self.watchers
            .lock()
            .values_mut()
            .any(|w| w.check_for_update(CheckMode::CheckOnly))
    }

    /// Run callbacks for one registered file, as if it had changed.
    ///
    /// # Errors
    ///
    /// `NotRegistered` for unknown paths; otherwise the first callback
    /// failure (all callbacks still run).
    pub fn file_changed(&self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let path = path.as_ref();
        let key = self
            .watchers
            .lock()
            .get(path)
            .map(|w| w.config_key().to_string())
            .ok_or_else(|| RegistryError::NotRegistered(path.to_path_buf()))?;
        match self.run_callbacks(path, &key).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clone of the watcher for `path`.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<ConfigWatcher> {
        self.watchers.lock().get(path.as_ref()).cloned()
    }

    /// Is `path` registered.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.watchers.lock().contains_key(path.as_ref())
    }

    /// Is any file registered under `config_key`.
    pub fn has_key(&self, config_key: &str) -> bool {
        self.watchers
            .lock()
            .values()
            .any(|w| w.config_key() == config_key)
    }

    /// Number of watched files.
    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.watchers.lock().is_empty()
    }

    fn run_callbacks(&self, path: &Path, key: &str) -> Vec<RegistryError> {
        let list: Vec<ChangeCallback> = self.callbacks.read().clone();
        list.iter()
            .filter_map(|cb| {
                cb(path, key).err().map(|reason| {
                    warn!(path = %path.display(), "change callback failed: {reason}");
                    RegistryError::Callback {
                        path: path.to_path_buf(),
                        reason,
                    }
                })
            })
            .collect()
    }
}
