//! Error hierarchy for the replication plane.
//!
//! Errors are grouped by the collaborator that produced them: the
//! coordination store, the relational database and extension code.
//! Background loops log every error and keep running; only process-wide
//! cancellation stops them.

use config::ConfigError;
use tokio::task::JoinError;

use crate::constants::MYSQL_DEADLOCK_MSG;
use crate::constants::SQLITE_DEADLOCK_MSG;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Coordination store failures (transport, locks, watches)
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Relational store failures
    #[error(transparent)]
    Db(#[from] DbError),

    /// Extension environment failures
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    /// A CAS precondition did not hold: another member made progress
    #[error("inconsistent cluster state at {path}: expected {expected}")]
    Inconsistent { path: String, expected: String },

    /// Input value misses a required field or has the wrong type
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Cluster configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cluster configuration validation failures
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Message dispatch was closed, no more waits or broadcasts are accepted
    #[error("message dispatch already closed")]
    DispatchClosed,

    #[error("background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Graceful exit requested
    #[error("exit")]
    Exit,

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Backend unreachable or timed out; callers retry
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("failed to lock path {path}")]
    LockFailed { path: String },

    /// Lease expired or was revoked while the lock was held
    #[error("lock for path {path} is lost")]
    LockLost { path: String },

    /// Watch started below the compaction frontier
    #[error("required revision has been compacted, compact revision: {compact_revision}")]
    Compacted { compact_revision: i64 },

    #[error("watch on {0} closed")]
    WatchClosed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error reported by the database engine, message preserved verbatim
    #[error("{0}")]
    Backend(String),

    #[error("resource not found: {schema}/{id}")]
    ResourceNotFound { schema: String, id: String },

    #[error("resource already exists: {schema}/{id}")]
    AlreadyExists { schema: String, id: String },

    /// Another transaction committed a write to the row first. Carries the
    /// MySQL deadlock text so the default retry predicate picks it up.
    #[error(
        "write conflict on {schema}/{id}: Deadlock found when trying to get lock; try restarting transaction"
    )]
    WriteConflict { schema: String, id: String },

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension {event} failed: {message}")]
    Failed { event: String, message: String },

    #[error("extension {event} exceeded its time limit of {limit_ms}ms")]
    Timeout { event: String, limit_ms: u64 },
}

impl Error {
    /// Default retry predicate: deadlock reported by MySQL/MariaDB or a
    /// locked SQLite database.
    pub fn is_deadlock(&self) -> bool {
        if matches!(self, Error::Db(DbError::WriteConflict { .. })) {
            return true;
        }
        let msg = self.to_string();
        msg.contains(MYSQL_DEADLOCK_MSG) || msg.contains(SQLITE_DEADLOCK_MSG)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Sync(SyncError::Unavailable(_))) || self.is_deadlock()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Db(DbError::ResourceNotFound { .. }) | Error::Sync(SyncError::KeyNotFound(_))
        )
    }

    /// Returns the compaction frontier when the watch fell off the history window.
    pub fn compacted_revision(&self) -> Option<i64> {
        match self {
            Error::Sync(SyncError::Compacted { compact_revision }) => Some(*compact_revision),
            _ => None,
        }
    }
}
