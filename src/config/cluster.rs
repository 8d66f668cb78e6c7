use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Identity of this member in `/gohan/cluster/process/<process_id>`.
    /// Generated at startup when absent.
    #[serde(default)]
    pub process_id: Option<String>,

    /// Lease duration of every coordination store lock (the masterTTL)
    #[serde(default = "default_master_ttl_secs")]
    pub master_ttl_secs: u64,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}
impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            process_id: None,
            master_ttl_secs: default_master_ttl_secs(),
            log_dir: default_log_dir(),
        }
    }
}

impl ClusterConfig {
    /// Validates cluster configuration consistency
    /// # Errors
    /// Returns `Error::InvalidConfig` if any configuration rules are violated
    pub fn validate(&self) -> Result<()> {
        if self.master_ttl_secs == 0 {
            return Err(Error::InvalidConfig("master_ttl_secs must be greater than 0".into()));
        }

        if let Some(id) = &self.process_id {
            if id.is_empty() || id.contains('/') {
                return Err(Error::InvalidConfig(format!(
                    "process_id `{}` must be non-empty and contain no '/'",
                    id
                )));
            }
        }

        self.validate_directory(&self.log_dir, "log_dir")?;

        Ok(())
    }

    pub fn master_ttl(&self) -> Duration {
        Duration::from_secs(self.master_ttl_secs)
    }

    /// Configured process id, or `<host>-<nanoid>` when none is set.
    pub fn resolve_process_id(&self) -> String {
        match &self.process_id {
            Some(id) => id.clone(),
            None => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "gohan".to_string());
                format!("{}-{}", host, nanoid::nanoid!(10))
            }
        }
    }

    /// Ensures directory path is valid and writable
    fn validate_directory(
        &self,
        path: &PathBuf,
        name: &str,
    ) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(format!("{} path cannot be empty", name)));
        }

        #[cfg(not(test))]
        {
            use std::fs;
            if !path.exists() {
                fs::create_dir_all(path).map_err(|e| {
                    Error::InvalidConfig(format!(
                        "Failed to create {} directory at {}: {}",
                        name,
                        path.display(),
                        e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

fn default_master_ttl_secs() -> u64 {
    10
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/gohan/logs")
}
