use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::MessageDispatch;
use crate::constants::LONG_POLL_NOTIFICATION_TTL_SECS;
use crate::constants::LONG_POLL_PREFIX;
use crate::constants::REVISION_CURRENT;
use crate::db::id_filter;
use crate::db::Database;
use crate::db::Event;
use crate::db::Filter;
use crate::db::LockPolicy;
use crate::db::Transaction;
use crate::db::TxOptions;
use crate::schema::IsolationLevel;
use crate::schema::Resource;
use crate::schema::ResourceState;
use crate::schema::Schema;
use crate::sync::CoordinationStore;
use crate::sync::EventAction;
use crate::utils::async_task::sleep_or_cancelled;
use crate::utils::time::now_millis;
use crate::Result;
use crate::SyncError;

/// Hex SHA-256 of the JSON rendering of a response body, used as the hash
/// of `MessageDispatch::get_or_wait`.
pub fn response_etag(value: &Value) -> String {
    format!("{:x}", Sha256::digest(value.to_string().as_bytes()))
}

/// Coordination store key announcing a change of `resource_path`.
pub fn long_poll_key(resource_path: &str) -> String {
    format!("{}{}", LONG_POLL_PREFIX, resource_path.trim_start_matches('/'))
}

/// Remembers the path of the last mutated resource and, once the
/// transaction committed, publishes a short-lived notification for it.
pub struct LongPollNotifier {
    inner: Box<dyn Transaction>,
    store: Arc<dyn CoordinationStore>,
    changed_path: Option<String>,
}

impl LongPollNotifier {
    pub fn new(
        inner: Box<dyn Transaction>,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            inner,
            store,
            changed_path: None,
        }
    }
}

async fn notify(
    store: &dyn CoordinationStore,
    path: &str,
) {
    let key = long_poll_key(path);
    let value = now_millis().to_string();
    match store.update_ttl(&key, &value, LONG_POLL_NOTIFICATION_TTL_SECS).await {
        Ok(()) => debug!(key, "long poll notification published"),
        Err(e) => warn!("failed to publish long poll notification {}: {}", key, e),
    }
}

#[async_trait]
impl Transaction for LongPollNotifier {
    async fn create(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        self.inner.create(resource).await?;
        self.changed_path = Some(resource.path().to_string());
        Ok(())
    }

    async fn update(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        self.inner.update(resource).await?;
        self.changed_path = Some(resource.path().to_string());
        Ok(())
    }

    async fn resync(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        self.inner.resync(resource).await
    }

    async fn state_update(
        &mut self,
        resource: &Resource,
        state: &ResourceState,
    ) -> Result<()> {
        self.inner.state_update(resource, state).await
    }

    async fn delete(
        &mut self,
        schema: &Schema,
        id: &str,
    ) -> Result<()> {
        let resource = self.inner.fetch(schema, &id_filter(id)).await?;
        self.inner.delete(schema, id).await?;
        self.changed_path = Some(resource.path().to_string());
        Ok(())
    }

    async fn fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<Resource> {
        self.inner.fetch(schema, filter).await
    }

    async fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: LockPolicy,
    ) -> Result<Resource> {
        self.inner.lock_fetch(schema, filter, policy).await
    }

    async fn state_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<ResourceState> {
        self.inner.state_fetch(schema, filter).await
    }

    async fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Resource>> {
        self.inner.list(schema, filter, limit).await
    }

    async fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
        policy: LockPolicy,
    ) -> Result<Vec<Resource>> {
        self.inner.lock_list(schema, filter, limit, policy).await
    }

    async fn query(
        &mut self,
        schema: &Schema,
        query: &str,
        arguments: Vec<Value>,
    ) -> Result<Vec<Resource>> {
        self.inner.query(schema, query, arguments).await
    }

    async fn insert_event(
        &mut self,
        event: &Event,
    ) -> Result<i64> {
        self.inner.insert_event(event).await
    }

    async fn list_events(
        &mut self,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.inner.list_events(limit).await
    }

    async fn delete_event(
        &mut self,
        id: i64,
    ) -> Result<()> {
        self.inner.delete_event(id).await
    }

    /// A failed notification never fails the commit.
    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await?;
        if let Some(path) = self.changed_path.take() {
            notify(self.store.as_ref(), &path).await;
        }
        Ok(())
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

pub struct LongPollDatabase {
    inner: Arc<dyn Database>,
    store: Arc<dyn CoordinationStore>,
}

impl LongPollDatabase {
    pub fn new(
        inner: Arc<dyn Database>,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl Database for LongPollDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.inner.begin().await?;
        Ok(Box::new(LongPollNotifier::new(tx, self.store.clone())))
    }

    async fn begin_tx(
        &self,
        options: &TxOptions,
    ) -> Result<Box<dyn Transaction>> {
        let tx = self.inner.begin_tx(options).await?;
        Ok(Box::new(LongPollNotifier::new(tx, self.store.clone())))
    }
}

/// Turns long-poll notifications written by any member into local
/// `MessageDispatch` broadcasts.
pub struct LongPollWatcher {
    store: Arc<dyn CoordinationStore>,
    dispatch: Arc<MessageDispatch>,
    backoff: Duration,
}

impl LongPollWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        dispatch: Arc<MessageDispatch>,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            dispatch,
            backoff,
        }
    }

    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.watch(&cancel).await {
                warn!("long poll watcher interrupted: {}", e);
            }
            if !sleep_or_cancelled(self.backoff, &cancel).await {
                return Ok(());
            }
        }
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let watch_cancel = cancel.child_token();
        let _guard = watch_cancel.clone().drop_guard();
        let mut events = self
            .store
            .watch(LONG_POLL_PREFIX, REVISION_CURRENT, watch_cancel)
            .await?;

        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                response = events.recv() => response,
            };
            let event = match response {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SyncError::WatchClosed(LONG_POLL_PREFIX.to_string()).into()),
            };
            if event.action != EventAction::Set {
                continue;
            }
            let Some(suffix) = event.key.strip_prefix(LONG_POLL_PREFIX) else {
                continue;
            };
            let key = format!("/{}", suffix);
            debug!(key, "long poll notification received");
            self.dispatch.broadcast(&key).await?;
        }
    }
}
