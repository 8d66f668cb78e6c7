use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Sync writer: drains the event table into the coordination store
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncConfig {
    /// Fallback drain period when no commit notification arrives
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of events read per drain
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Pause before re-entering leader election after an interruption
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Deadline of the unlock call issued when the writer steps down
    #[serde(default = "default_unlock_timeout_ms")]
    pub unlock_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_limit: default_batch_limit(),
            backoff_ms: default_backoff_ms(),
            unlock_timeout_ms: default_unlock_timeout_ms(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("sync.poll_interval_ms cannot be 0".into()));
        }
        if self.batch_limit == 0 {
            return Err(Error::InvalidConfig("sync.batch_limit must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn unlock_timeout(&self) -> Duration {
        Duration::from_millis(self.unlock_timeout_ms)
    }
}

/// Path watchers: extension dispatch for watched coordination store prefixes
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Watched prefixes; the position in this list drives priorities
    #[serde(default)]
    pub keys: Vec<String>,

    /// Extension event names, matched as `/<event>` prefixes of event keys
    #[serde(default)]
    pub events: Vec<String>,

    /// Time limit of one extension invocation
    #[serde(default = "default_extension_timeout_ms")]
    pub extension_timeout_ms: u64,

    /// Pause before the membership watch is re-established
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            keys: vec![],
            events: vec![],
            extension_timeout_ms: default_extension_timeout_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        for key in &self.keys {
            if !key.starts_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "watch key `{}` must start with '/'",
                    key
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for key in &self.keys {
            if !seen.insert(key) {
                return Err(Error::InvalidConfig(format!("duplicate watch key `{}`", key)));
            }
        }
        Ok(())
    }

    pub fn extension_timeout(&self) -> Duration {
        Duration::from_millis(self.extension_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StateWatchConfig {
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for StateWatchConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl StateWatchConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    30_000
}
fn default_batch_limit() -> usize {
    10_000
}
fn default_backoff_ms() -> u64 {
    5_000
}
fn default_unlock_timeout_ms() -> u64 {
    3_000
}
fn default_extension_timeout_ms() -> u64 {
    30_000
}
