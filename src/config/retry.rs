use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Name of the only built-in retry predicate.
pub const DEADLOCK_STRATEGY: &str = "deadlock";

/// Database transaction retry policies
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Per-operation retries inside a transaction
    #[serde(default)]
    pub transaction_retries: TransactionRetryConfig,

    /// Whole-transaction retries of scoped (`within_tx`) units of work
    #[serde(default)]
    pub scoped_retries: ScopedRetryConfig,
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        self.transaction_retries.validate()?;
        Ok(())
    }
}

/// Operation-level retry policy of the retryable transaction
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransactionRetryConfig {
    /// Number of attempts per operation; negative means unlimited
    #[serde(default = "default_attempts")]
    pub attempts: i32,

    /// Name of the retry predicate
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Sleep between two attempts (unit: milliseconds)
    #[serde(default = "default_interval_between_attempts_ms")]
    pub interval_between_attempts_ms: u64,
}

impl Default for TransactionRetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            strategy: default_strategy(),
            interval_between_attempts_ms: default_interval_between_attempts_ms(),
        }
    }
}

impl TransactionRetryConfig {
    fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::InvalidConfig(
                "database.transaction_retries.attempts cannot be 0".into(),
            ));
        }
        Ok(())
    }

    pub fn interval_between_attempts(&self) -> Duration {
        Duration::from_millis(self.interval_between_attempts_ms)
    }
}

/// Retry policy of a whole scoped transaction
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
pub struct ScopedRetryConfig {
    /// Extra attempts after the first one (0 disables retries)
    #[serde(default)]
    pub count: u32,

    /// Base interval, a random jitter of the same magnitude is added (unit: milliseconds)
    #[serde(default)]
    pub interval_ms: u64,
}

fn default_attempts() -> i32 {
    1
}
fn default_strategy() -> String {
    DEADLOCK_STRATEGY.to_string()
}
fn default_interval_between_attempts_ms() -> u64 {
    100
}
