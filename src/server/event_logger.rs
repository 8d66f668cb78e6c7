use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use super::CommitNotifier;
use crate::db::id_filter;
use crate::db::Database;
use crate::db::Event;
use crate::db::EventType;
use crate::db::Filter;
use crate::db::LockPolicy;
use crate::db::Transaction;
use crate::db::TxOptions;
use crate::metrics::EVENT_LOGGER_EVENTS;
use crate::schema::IsolationLevel;
use crate::schema::Resource;
use crate::schema::ResourceState;
use crate::schema::Schema;
use crate::schema::SchemaManager;
use crate::utils::time::now_secs;
use crate::DbError;
use crate::Result;

/// Appends an event row for every create, update, resync and delete in the
/// same transaction as the mutation itself, then tells the commit informer
/// once the transaction committed.
pub struct EventLogger {
    inner: Box<dyn Transaction>,
    schemas: Arc<SchemaManager>,
    notifier: Arc<dyn CommitNotifier>,
    last_event_id: Option<i64>,
}

impl EventLogger {
    pub fn new(
        inner: Box<dyn Transaction>,
        schemas: Arc<SchemaManager>,
        notifier: Arc<dyn CommitNotifier>,
    ) -> Self {
        Self {
            inner,
            schemas,
            notifier,
            last_event_id: None,
        }
    }

    /// Id of the last event row logged by this transaction
    pub fn last_event_id(&self) -> Option<i64> {
        self.last_event_id
    }

    fn schema(
        &self,
        schema_id: &str,
    ) -> Result<Arc<Schema>> {
        self.schemas
            .schema(schema_id)
            .ok_or_else(|| DbError::UnknownSchema(schema_id.to_string()).into())
    }

    /// `config_version` of state-versioned resources, 0 otherwise.
    async fn config_version(
        &mut self,
        schema: &Schema,
        id: &str,
    ) -> Result<i64> {
        if !schema.state_versioning() {
            return Ok(0);
        }
        let state = self.inner.state_fetch(schema, &id_filter(id)).await?;
        Ok(state.config_version)
    }

    async fn log_event(
        &mut self,
        schema: &Schema,
        event_type: EventType,
        resource: &Resource,
        version: i64,
    ) -> Result<()> {
        let event = Event {
            id: 0,
            event_type,
            path: resource.path().to_string(),
            body: resource.to_json()?,
            version,
            sync_plain: schema.metadata.sync_plain,
            sync_property: schema.metadata.sync_property.clone(),
            timestamp: now_secs(),
        };
        let id = self.inner.insert_event(&event).await?;
        trace!(id, %event_type, path = %event.path, version, "event logged");
        EVENT_LOGGER_EVENTS.with_label_values(&[event_type.as_str()]).inc();
        self.last_event_id = Some(id);
        Ok(())
    }
}

#[async_trait]
impl Transaction for EventLogger {
    async fn create(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        let schema = self.schema(resource.schema_id())?;
        self.inner.create(resource).await?;
        if schema.metadata.nosync {
            return Ok(());
        }
        self.log_event(&schema, EventType::Create, resource, 1).await
    }

    async fn update(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        let schema = self.schema(resource.schema_id())?;
        self.inner.update(resource).await?;
        if schema.metadata.nosync {
            return Ok(());
        }
        let version = self.config_version(&schema, resource.id()).await?;
        self.log_event(&schema, EventType::Update, resource, version).await
    }

    async fn resync(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        let schema = self.schema(resource.schema_id())?;
        if schema.metadata.nosync {
            return Ok(());
        }
        let version = self.config_version(&schema, resource.id()).await?;
        self.log_event(&schema, EventType::Update, resource, version).await
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
        if schema.metadata.nosync {
            return self.inner.delete(schema, id).await;
        }

        let resource = self.inner.fetch(schema, &id_filter(id)).await?;
        let version = match schema.state_versioning() {
            true => self.config_version(schema, id).await? + 1,
            false => 0,
        };
        self.inner.delete(schema, id).await?;
        self.log_event(schema, EventType::Delete, &resource, version).await
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

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await?;
        if let Some(id) = self.last_event_id {
            debug!(event_id = id, "transaction with events committed");
            self.notifier.notify(id);
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

/// Database decorator handing out `EventLogger` transactions.
pub struct EventLoggingDatabase {
    inner: Arc<dyn Database>,
    schemas: Arc<SchemaManager>,
    notifier: Arc<dyn CommitNotifier>,
}

impl EventLoggingDatabase {
    pub fn new(
        inner: Arc<dyn Database>,
        schemas: Arc<SchemaManager>,
        notifier: Arc<dyn CommitNotifier>,
    ) -> Self {
        Self {
            inner,
            schemas,
            notifier,
        }
    }

    fn wrap(
        &self,
        tx: Box<dyn Transaction>,
    ) -> Box<dyn Transaction> {
        Box::new(EventLogger::new(tx, self.schemas.clone(), self.notifier.clone()))
    }
}

#[async_trait]
impl Database for EventLoggingDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(self.wrap(self.inner.begin().await?))
    }

    async fn begin_tx(
        &self,
        options: &TxOptions,
    ) -> Result<Box<dyn Transaction>> {
        Ok(self.wrap(self.inner.begin_tx(options).await?))
    }
}
