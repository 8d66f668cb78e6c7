//! Configuration management for a replication plane member.
//!
//! Provides hierarchical configuration loading from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Main config file (`config/gohan.toml`, optional)
//! 3. File named by `GOHAN_CONFIG_PATH` (optional)
//! 4. Environment variables (highest priority), e.g. `GOHAN__SYNC__BATCH_LIMIT=500`
//!

mod cluster;
mod monitoring;
mod retry;
mod watch;
pub use cluster::*;
pub use monitoring::*;
pub use retry::*;
pub use watch::*;

#[cfg(test)]
mod config_test;

//---
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

pub(crate) const ENV_PREFIX: &str = "GOHAN";
pub(crate) const ENV_CONFIG_PATH: &str = "GOHAN_CONFIG_PATH";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Cluster membership and lease settings
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Transaction retry policies
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Sync writer settings
    #[serde(default)]
    pub sync: SyncConfig,
    /// Path watcher settings
    #[serde(default)]
    pub watch: WatchConfig,
    /// State reconciliation watcher settings
    #[serde(default)]
    pub state_watch: StateWatchConfig,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Load configuration from defaults, the optional main file, the file
    /// named by `GOHAN_CONFIG_PATH` and finally environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("config/gohan").required(false));

        if let Ok(path) = env::var(ENV_CONFIG_PATH) {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let settings: Settings = builder
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Merge a TOML file on top of the current settings. Environment
    /// variables keep the highest priority.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates all subsystem configurations
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.database.validate()?;
        self.sync.validate()?;
        self.watch.validate()?;
        self.state_watch.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
