//! Relational store seams.
//!
//! Everything the replication plane needs from the database goes through a
//! `Transaction`. Decorators (retries, event logging, long-poll
//! notification) implement the same trait and wrap an inner transaction.

mod mem;
mod retryable;
mod within;
pub use mem::*;
pub use retryable::*;
pub use within::*;


use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::schema::IsolationLevel;
use crate::schema::Resource;
use crate::schema::ResourceState;
use crate::schema::Schema;
use crate::Result;

/// Property equality filter; an array value matches any of its elements.
pub type Filter = Map<String, Value>;

pub fn id_filter(id: &str) -> Filter {
    let mut filter = Filter::new();
    filter.insert("id".to_string(), Value::String(id.to_string()));
    filter
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPolicy {
    #[default]
    NoLocking,
    LockRelatedResources,
    SkipRelatedResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation_level: IsolationLevel,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::RepeatableRead,
        }
    }
}

impl TxOptions {
    pub fn with_isolation_level(isolation_level: IsolationLevel) -> Self {
        Self { isolation_level }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => crate::constants::EVENT_TYPE_CREATE,
            EventType::Update => crate::constants::EVENT_TYPE_UPDATE,
            EventType::Delete => crate::constants::EVENT_TYPE_DELETE,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the event table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the database on insert
    pub id: i64,
    pub event_type: EventType,
    /// Canonical resource path, e.g. `/v2.0/networks/n1`
    pub path: String,
    /// JSON snapshot of the resource
    pub body: String,
    pub version: i64,
    pub sync_plain: bool,
    pub sync_property: Option<String>,
    /// Unix seconds
    pub timestamp: i64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transaction: Send {
    async fn create(
        &mut self,
        resource: &Resource,
    ) -> Result<()>;

    async fn update(
        &mut self,
        resource: &Resource,
    ) -> Result<()>;

    /// Re-emits the resource without mutating it. Only meaningful for
    /// event-logging decorators.
    async fn resync(
        &mut self,
        _resource: &Resource,
    ) -> Result<()> {
        Ok(())
    }

    async fn state_update(
        &mut self,
        resource: &Resource,
        state: &ResourceState,
    ) -> Result<()>;

    async fn delete(
        &mut self,
        schema: &Schema,
        id: &str,
    ) -> Result<()>;

    async fn fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<Resource>;

    async fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: LockPolicy,
    ) -> Result<Resource>;

    async fn state_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<ResourceState>;

    async fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Resource>>;

    async fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
        policy: LockPolicy,
    ) -> Result<Vec<Resource>>;

    async fn query(
        &mut self,
        schema: &Schema,
        query: &str,
        arguments: Vec<Value>,
    ) -> Result<Vec<Resource>>;

    /// Appends an event row, returning its id.
    async fn insert_event(
        &mut self,
        event: &Event,
    ) -> Result<i64>;

    /// Oldest events first.
    async fn list_events(
        &mut self,
        limit: usize,
    ) -> Result<Vec<Event>>;

    async fn delete_event(
        &mut self,
        id: i64,
    ) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    /// Rolls back unless already committed.
    async fn close(&mut self) -> Result<()>;

    fn closed(&self) -> bool;

    fn isolation_level(&self) -> IsolationLevel;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    async fn begin_tx(
        &self,
        options: &TxOptions,
    ) -> Result<Box<dyn Transaction>>;
}
