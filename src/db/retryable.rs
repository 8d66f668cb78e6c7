use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::error;
use tracing::warn;

use super::Database;
use super::Event;
use super::Filter;
use super::LockPolicy;
use super::Transaction;
use super::TxOptions;
use crate::config::TransactionRetryConfig;
use crate::config::DEADLOCK_STRATEGY;
use crate::schema::IsolationLevel;
use crate::schema::Resource;
use crate::schema::ResourceState;
use crate::schema::Schema;
use crate::Error;
use crate::Result;

pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Operation-level retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts per operation, negative for unlimited
    pub attempts: i32,
    pub interval: Duration,
    pub predicate: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("interval", &self.interval)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransactionRetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TransactionRetryConfig) -> Self {
        if config.strategy != DEADLOCK_STRATEGY {
            error!(
                "unknown transaction retry strategy `{}`, falling back to `{}`",
                config.strategy, DEADLOCK_STRATEGY
            );
        }
        Self {
            attempts: config.attempts,
            interval: config.interval_between_attempts(),
            predicate: Arc::new(Error::is_deadlock),
        }
    }

    /// Whether a failed `attempt` (1-based) should be tried again.
    pub fn should_retry(
        &self,
        e: &Error,
        attempt: i32,
    ) -> bool {
        (self.predicate)(e) && (self.attempts < 0 || attempt < self.attempts)
    }
}

/// Re-evaluates `$call` until it succeeds or the policy gives up; the last
/// observed error is returned.
macro_rules! retry_on_error {
    ($self:ident, $op:expr, $call:expr) => {{
        let mut attempt = 1;
        loop {
            match $call.await {
                Ok(v) => break Ok(v),
                Err(e) if $self.policy.should_retry(&e, attempt) => {
                    warn!(op = $op, attempt, "retrying transaction operation: {}", e);
                    sleep($self.policy.interval).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

/// Retries individual operations of the wrapped transaction. Commit and
/// close are never retried.
pub struct RetryableTransaction {
    inner: Box<dyn Transaction>,
    policy: RetryPolicy,
}

impl RetryableTransaction {
    pub fn new(
        inner: Box<dyn Transaction>,
        policy: RetryPolicy,
    ) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Transaction for RetryableTransaction {
    async fn create(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        retry_on_error!(self, "create", self.inner.create(resource))
    }

    async fn update(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        retry_on_error!(self, "update", self.inner.update(resource))
    }

    async fn resync(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        retry_on_error!(self, "resync", self.inner.resync(resource))
    }

    async fn state_update(
        &mut self,
        resource: &Resource,
        state: &ResourceState,
    ) -> Result<()> {
        retry_on_error!(self, "state_update", self.inner.state_update(resource, state))
    }

    async fn delete(
        &mut self,
        schema: &Schema,
        id: &str,
    ) -> Result<()> {
        retry_on_error!(self, "delete", self.inner.delete(schema, id))
    }

    async fn fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<Resource> {
        retry_on_error!(self, "fetch", self.inner.fetch(schema, filter))
    }

    async fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: LockPolicy,
    ) -> Result<Resource> {
        retry_on_error!(self, "lock_fetch", self.inner.lock_fetch(schema, filter, policy))
    }

    async fn state_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<ResourceState> {
        retry_on_error!(self, "state_fetch", self.inner.state_fetch(schema, filter))
    }

    async fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Resource>> {
        retry_on_error!(self, "list", self.inner.list(schema, filter, limit))
    }

    async fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
        policy: LockPolicy,
    ) -> Result<Vec<Resource>> {
        retry_on_error!(self, "lock_list", self.inner.lock_list(schema, filter, limit, policy))
    }

    async fn query(
        &mut self,
        schema: &Schema,
        query: &str,
        arguments: Vec<Value>,
    ) -> Result<Vec<Resource>> {
        retry_on_error!(self, "query", self.inner.query(schema, query, arguments.clone()))
    }

    async fn insert_event(
        &mut self,
        event: &Event,
    ) -> Result<i64> {
        retry_on_error!(self, "insert_event", self.inner.insert_event(event))
    }

    async fn list_events(
        &mut self,
        limit: usize,
    ) -> Result<Vec<Event>> {
        retry_on_error!(self, "list_events", self.inner.list_events(limit))
    }

    async fn delete_event(
        &mut self,
        id: i64,
    ) -> Result<()> {
        retry_on_error!(self, "delete_event", self.inner.delete_event(id))
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.inner.isolation_level()
    }
}

/// Database decorator handing out `RetryableTransaction`s.
pub struct RetryableDatabase {
    inner: Arc<dyn Database>,
    policy: RetryPolicy,
}

impl RetryableDatabase {
    pub fn new(
        inner: Arc<dyn Database>,
        policy: RetryPolicy,
    ) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Database for RetryableDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.inner.begin().await?;
        Ok(Box::new(RetryableTransaction::new(tx, self.policy.clone())))
    }

    async fn begin_tx(
        &self,
        options: &TxOptions,
    ) -> Result<Box<dyn Transaction>> {
        let tx = self.inner.begin_tx(options).await?;
        Ok(Box::new(RetryableTransaction::new(tx, self.policy.clone())))
    }
}
