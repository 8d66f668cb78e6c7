//! Coordination store client.
//!
//! A strongly consistent, watchable key-value store with lease-backed locks.
//! Every mutation is stamped with a monotonically increasing revision; watches
//! can be resumed from any revision that has not been compacted yet.
//!
//! `MemStore`/`MemSync` provide the in-process reference implementation used
//! by the standalone binary and by tests.

mod mem_store;
mod mem_sync;
pub use mem_store::*;
pub use mem_sync::*;


use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::SyncError;

/// Item of a watch stream. An `Err` is terminal.
pub type WatchResponse = std::result::Result<SyncEvent, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    /// Current value replayed when a watch starts at `REVISION_CURRENT`
    Get,
    Set,
    Delete,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Get => "get",
            EventAction::Set => "set",
            EventAction::Delete => "delete",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub action: EventAction,
    pub key: String,
    pub value: String,
    /// `value` decoded as a JSON object, empty when it is not one
    pub data: Map<String, Value>,
    /// Revision of the commit that produced the change
    pub revision: i64,
}

impl SyncEvent {
    pub fn new(
        action: EventAction,
        key: impl Into<String>,
        value: impl Into<String>,
        revision: i64,
    ) -> Self {
        let value = value.into();
        let data = match serde_json::from_str::<Value>(&value) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            action,
            key: key.into(),
            value,
            data,
            revision,
        }
    }
}

/// Result of a fetch. A prefix fetch returns every descendant key in `children`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub key: String,
    pub value: String,
    /// Modification revision, 0 for a pure prefix node
    pub revision: i64,
    pub children: Vec<Node>,
}

/// Precondition of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasCondition {
    /// Current value equals the given one
    ValueEquals(String),
    /// Current modification revision equals the given one (0: key absent)
    RevisionEquals(i64),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Identity of the member owning this client
    fn process_id(&self) -> String;

    async fn has_lock(
        &self,
        key: &str,
    ) -> bool;

    /// Acquires a lease-backed lock on `key`. The lease is refreshed while
    /// held; the returned token is cancelled once the lease is lost.
    ///
    /// # Errors
    /// `SyncError::LockFailed` when the key is taken and `block` is false.
    async fn lock(
        &self,
        key: &str,
        block: bool,
    ) -> Result<CancellationToken>;

    async fn unlock(
        &self,
        key: &str,
    ) -> Result<()>;

    /// Exact key, or the prefix node with its descendants. `None` when neither exists.
    async fn fetch(
        &self,
        key: &str,
    ) -> Result<Option<Node>>;

    async fn update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Put bound to a lease of `ttl_secs`; the key disappears when the lease expires.
    async fn update_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<()>;

    /// Missing keys are not errors.
    async fn delete(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<()>;

    /// Writes `value` only if every condition holds. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        conditions: &[CasCondition],
    ) -> Result<bool>;

    /// Streams changes under the `key` prefix starting at `from_revision`
    /// (`REVISION_CURRENT`: current values first, then live changes).
    ///
    /// # Errors
    /// `SyncError::Compacted` when `from_revision` fell off the history window.
    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchResponse>>;
}
