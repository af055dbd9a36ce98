//! Process-wide services, built once at startup and passed explicitly.

use std::sync::Arc;
use warden_common::config::WardenConfig;

use crate::alarms::AlarmCenter;
use crate::registry::{ConfigRegistry, RegistryError};

/// Shared alarm center and configuration registry.
#[derive(Debug, Clone)]
pub struct Context {
    /// Operator alarms.
    pub alarms: Arc<AlarmCenter>,
    /// Watched configuration files.
    pub configs: Arc<ConfigRegistry>,
}

impl Context {
    /// Wrap existing services.
    pub fn new(alarms: AlarmCenter, configs: ConfigRegistry) -> Self {
        Self {
            alarms: Arc::new(alarms),
            configs: Arc::new(configs),
        }
    }

    /// Build from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails when a required configuration file is missing.
    pub fn from_config(config: &WardenConfig) -> Result<Self, RegistryError> {
        let configs = ConfigRegistry::from_entries(&config.config_files)?;
        Ok(Self::new(AlarmCenter::from_config(&config.alarm), configs))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(AlarmCenter::new(None), ConfigRegistry::new())
    }
}
