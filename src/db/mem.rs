use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use super::Database;
use super::Event;
use super::Filter;
use super::LockPolicy;
use super::Transaction;
use super::TxOptions;
use crate::schema::IsolationLevel;
use crate::schema::Resource;
use crate::schema::ResourceState;
use crate::schema::Schema;
use crate::schema::SchemaManager;
use crate::DbError;
use crate::Result;

#[derive(Debug, Clone)]
struct Row {
    resource: Resource,
    state: Option<ResourceState>,
    /// Commit that last wrote the row
    revision: u64,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    /// schema id -> resource id -> row
    resources: HashMap<String, BTreeMap<String, Row>>,
    events: BTreeMap<i64, Event>,
    revision: u64,
}

impl Tables {
    fn row(
        &self,
        schema_id: &str,
        id: &str,
    ) -> Option<&Row> {
        self.resources.get(schema_id).and_then(|rows| rows.get(id))
    }

    fn row_mut(
        &mut self,
        schema_id: &str,
        id: &str,
    ) -> Option<&mut Row> {
        self.resources.get_mut(schema_id).and_then(|rows| rows.get_mut(id))
    }
}

/// Row writes are replayed against the committed row, so a state report
/// never carries a stale resource body or `config_version` along.
#[derive(Debug, Clone)]
enum WriteOp {
    InsertRow { schema: String, row: Row },
    UpdateResource { schema: String, resource: Resource },
    UpdateState { schema: String, id: String, state: ResourceState },
    RemoveRow { schema: String, id: String },
    PutEvent(Event),
    RemoveEvent(i64),
}

/// Snapshot isolation levels abort on write-write conflicts (first
/// committer wins); the weaker levels apply writes onto the latest row.
fn detects_write_conflicts(level: IsolationLevel) -> bool {
    matches!(level, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
}

fn apply_state(
    row: &mut Row,
    state: ResourceState,
) {
    let config_version = row.state.as_ref().map(|s| s.config_version).unwrap_or_default();
    row.state = Some(ResourceState {
        config_version,
        ..state
    });
}

struct Shared {
    committed: Mutex<Tables>,
    next_event_id: AtomicI64,
    failing_commits: AtomicUsize,
    failure_message: Mutex<String>,
}

/// In-memory database: every transaction reads a snapshot taken at begin
/// and applies its write set atomically on commit. Under REPEATABLE READ
/// and SERIALIZABLE a commit fails with `DbError::WriteConflict` when a row
/// it wrote was committed by someone else after its snapshot.
#[derive(Clone)]
pub struct MemDatabase {
    shared: Arc<Shared>,
    schemas: Arc<SchemaManager>,
}

impl MemDatabase {
    pub fn new(schemas: Arc<SchemaManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: Mutex::new(Tables::default()),
                next_event_id: AtomicI64::new(0),
                failing_commits: AtomicUsize::new(0),
                failure_message: Mutex::new(String::new()),
            }),
            schemas,
        }
    }

    /// The next `count` commits fail with a backend error carrying `message`.
    pub fn fail_next_commits(
        &self,
        count: usize,
        message: &str,
    ) {
        *self.shared.failure_message.lock() = message.to_string();
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Committed event rows, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.shared.committed.lock().events.values().cloned().collect()
    }

    /// Committed state record of a resource.
    pub fn resource_state(
        &self,
        schema_id: &str,
        id: &str,
    ) -> Option<ResourceState> {
        self.shared
            .committed
            .lock()
            .resources
            .get(schema_id)
            .and_then(|rows| rows.get(id))
            .and_then(|row| row.state.clone())
    }

    pub fn resource(
        &self,
        schema_id: &str,
        id: &str,
    ) -> Option<Resource> {
        self.shared
            .committed
            .lock()
            .resources
            .get(schema_id)
            .and_then(|rows| rows.get(id))
            .map(|row| row.resource.clone())
    }

    fn transaction(
        &self,
        isolation_level: IsolationLevel,
    ) -> MemTransaction {
        MemTransaction {
            snapshot: self.shared.committed.lock().clone(),
            writes: vec![],
            base: HashMap::new(),
            shared: self.shared.clone(),
            schemas: self.schemas.clone(),
            isolation_level,
            closed: false,
        }
    }
}

#[async_trait]
impl Database for MemDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.transaction(TxOptions::default().isolation_level)))
    }

    async fn begin_tx(
        &self,
        options: &TxOptions,
    ) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.transaction(options.isolation_level)))
    }
}

pub struct MemTransaction {
    snapshot: Tables,
    writes: Vec<WriteOp>,
    /// Revision each written row had in the snapshot, `None` if absent
    base: HashMap<(String, String), Option<u64>>,
    shared: Arc<Shared>,
    schemas: Arc<SchemaManager>,
    isolation_level: IsolationLevel,
    closed: bool,
}

impl MemTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::TransactionClosed.into());
        }
        Ok(())
    }

    fn state_versioning(
        &self,
        schema_id: &str,
    ) -> Result<bool> {
        self.schemas
            .schema(schema_id)
            .map(|s| s.state_versioning())
            .ok_or_else(|| DbError::UnknownSchema(schema_id.to_string()).into())
    }

    fn row(
        &self,
        schema_id: &str,
        id: &str,
    ) -> Option<&Row> {
        self.snapshot.row(schema_id, id)
    }

    fn existing_row(
        &mut self,
        schema_id: &str,
        id: &str,
    ) -> Result<&mut Row> {
        self.snapshot.row_mut(schema_id, id).ok_or_else(|| {
            DbError::ResourceNotFound {
                schema: schema_id.to_string(),
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Remembers the snapshot revision of a row before its first write.
    fn touch(
        &mut self,
        schema_id: &str,
        id: &str,
    ) {
        let seen = self.snapshot.row(schema_id, id).map(|row| row.revision);
        self.base
            .entry((schema_id.to_string(), id.to_string()))
            .or_insert(seen);
    }

    /// First written row that another commit changed after the snapshot.
    fn conflict(
        &self,
        committed: &Tables,
    ) -> Option<(String, String)> {
        self.base
            .iter()
            .find(|((schema, id), seen)| committed.row(schema, id).map(|row| row.revision) != **seen)
            .map(|(key, _)| key.clone())
    }

    fn matching(
        &self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Vec<Resource> {
        let Some(rows) = self.snapshot.resources.get(&schema.id) else {
            return vec![];
        };
        rows.values()
            .filter(|row| matches_filter(&row.resource, filter))
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| row.resource.clone())
            .collect()
    }

    fn find_one(
        &self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<&Row> {
        self.snapshot
            .resources
            .get(&schema.id)
            .and_then(|rows| rows.values().find(|row| matches_filter(&row.resource, filter)))
            .ok_or_else(|| {
                DbError::ResourceNotFound {
                    schema: schema.id.clone(),
                    id: filter
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }
                .into()
            })
    }
}

fn matches_filter(
    resource: &Resource,
    filter: &Filter,
) -> bool {
    filter.iter().all(|(property, expected)| {
        let actual = resource.get(property);
        match expected {
            Value::Array(candidates) => actual.map(|a| candidates.contains(a)).unwrap_or(false),
            other => actual == Some(other),
        }
    })
}

#[async_trait]
impl Transaction for MemTransaction {
    async fn create(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        self.ensure_open()?;
        let (schema, id) = (resource.schema_id(), resource.id());
        if self.row(schema, id).is_some() {
            return Err(DbError::AlreadyExists {
                schema: schema.to_string(),
                id: id.to_string(),
            }
            .into());
        }
        let row = Row {
            resource: resource.clone(),
            state: self.state_versioning(schema)?.then(ResourceState::initial),
            revision: 0,
        };
        self.touch(schema, id);
        self.snapshot
            .resources
            .entry(schema.to_string())
            .or_default()
            .insert(id.to_string(), row.clone());
        self.writes.push(WriteOp::InsertRow {
            schema: schema.to_string(),
            row,
        });
        Ok(())
    }

    async fn update(
        &mut self,
        resource: &Resource,
    ) -> Result<()> {
        self.ensure_open()?;
        let (schema, id) = (resource.schema_id(), resource.id());
        self.existing_row(schema, id)?;
        self.touch(schema, id);
        let row = self.existing_row(schema, id)?;
        row.resource = resource.clone();
        if let Some(state) = row.state.as_mut() {
            state.config_version += 1;
        }
        self.writes.push(WriteOp::UpdateResource {
            schema: schema.to_string(),
            resource: resource.clone(),
        });
        Ok(())
    }

    /// Writes the state columns only; `config_version` stays whatever the
    /// row holds when the transaction commits.
    async fn state_update(
        &mut self,
        resource: &Resource,
        state: &ResourceState,
    ) -> Result<()> {
        self.ensure_open()?;
        let (schema, id) = (resource.schema_id(), resource.id());
        self.existing_row(schema, id)?;
        self.touch(schema, id);
        apply_state(self.existing_row(schema, id)?, state.clone());
        self.writes.push(WriteOp::UpdateState {
            schema: schema.to_string(),
            id: id.to_string(),
            state: state.clone(),
        });
        Ok(())
    }

    async fn delete(
        &mut self,
        schema: &Schema,
        id: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        self.existing_row(&schema.id, id)?;
        self.touch(&schema.id, id);
        if let Some(rows) = self.snapshot.resources.get_mut(&schema.id) {
            rows.remove(id);
        }
        self.writes.push(WriteOp::RemoveRow {
            schema: schema.id.clone(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<Resource> {
        self.ensure_open()?;
        Ok(self.find_one(schema, filter)?.resource.clone())
    }

    async fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        _policy: LockPolicy,
    ) -> Result<Resource> {
        self.fetch(schema, filter).await
    }

    async fn state_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
    ) -> Result<ResourceState> {
        self.ensure_open()?;
        Ok(self.find_one(schema, filter)?.state.clone().unwrap_or_default())
    }

    async fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Resource>> {
        self.ensure_open()?;
        Ok(self.matching(schema, filter, limit))
    }

    async fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        limit: Option<usize>,
        _policy: LockPolicy,
    ) -> Result<Vec<Resource>> {
        self.list(schema, filter, limit).await
    }

    async fn query(
        &mut self,
        _schema: &Schema,
        _query: &str,
        _arguments: Vec<Value>,
    ) -> Result<Vec<Resource>> {
        Err(DbError::Unsupported("query").into())
    }

    async fn insert_event(
        &mut self,
        event: &Event,
    ) -> Result<i64> {
        self.ensure_open()?;
        let id = self.shared.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event { id, ..event.clone() };
        trace!(id, path = %event.path, "event row inserted");
        self.snapshot.events.insert(id, event.clone());
        self.writes.push(WriteOp::PutEvent(event));
        Ok(id)
    }

    async fn list_events(
        &mut self,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.ensure_open()?;
        Ok(self.snapshot.events.values().take(limit).cloned().collect())
    }

    async fn delete_event(
        &mut self,
        id: i64,
    ) -> Result<()> {
        self.ensure_open()?;
        self.snapshot.events.remove(&id);
        self.writes.push(WriteOp::RemoveEvent(id));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;

        let failing = self.shared.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(DbError::Backend(self.shared.failure_message.lock().clone()).into());
        }

        let mut committed = self.shared.committed.lock();
        if detects_write_conflicts(self.isolation_level) {
            if let Some((schema, id)) = self.conflict(&committed) {
                debug!(%schema, %id, "write conflict, transaction rolled back");
                self.writes.clear();
                return Err(DbError::WriteConflict { schema, id }.into());
            }
        }

        committed.revision += 1;
        let revision = committed.revision;
        for op in self.writes.drain(..) {
            match op {
                WriteOp::InsertRow { schema, mut row } => {
                    row.revision = revision;
                    committed
                        .resources
                        .entry(schema)
                        .or_default()
                        .insert(row.resource.id().to_string(), row);
                }
                WriteOp::UpdateResource { schema, resource } => {
                    let Some(row) = committed.row_mut(&schema, resource.id()) else {
                        debug!(%schema, id = resource.id(), "updated row is gone");
                        continue;
                    };
                    row.resource = resource;
                    if let Some(state) = row.state.as_mut() {
                        state.config_version += 1;
                    }
                    row.revision = revision;
                }
                WriteOp::UpdateState { schema, id, state } => {
                    let Some(row) = committed.row_mut(&schema, &id) else {
                        debug!(%schema, %id, "row of state update is gone");
                        continue;
                    };
                    apply_state(row, state);
                    row.revision = revision;
                }
                WriteOp::RemoveRow { schema, id } => {
                    if let Some(rows) = committed.resources.get_mut(&schema) {
                        rows.remove(&id);
                    }
                }
                WriteOp::PutEvent(event) => {
                    committed.events.insert(event.id, event);
                }
                WriteOp::RemoveEvent(id) => {
                    committed.events.remove(&id);
                }
            }
        }
        debug!(revision, "transaction committed");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.writes.clear();
        }
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }
}
