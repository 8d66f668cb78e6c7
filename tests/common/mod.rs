use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gohan::db::Database;
use gohan::db::MemDatabase;
use gohan::db::Transaction;
use gohan::extension::Context;
use gohan::extension::Environment;
use gohan::schema::Resource;
use gohan::schema::Schema;
use gohan::schema::SchemaManager;
use gohan::schema::SyncMetadata;
use gohan::server::CommitInformer;
use gohan::server::CommitInformerWorker;
use gohan::server::EventLoggingDatabase;
use gohan::sync::MemStore;
use gohan::sync::MemSync;
use gohan::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub const MASTER_TTL: Duration = Duration::from_secs(10);

pub fn enable_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn schemas() -> Arc<SchemaManager> {
    let mut manager = SchemaManager::new();
    manager
        .register(
            Schema::new("network", "networks", "/v2.0/networks").with_metadata(SyncMetadata {
                state_versioning: true,
                ..Default::default()
            }),
        )
        .unwrap();
    manager
        .register(Schema::new("subnet", "subnets", "/v2.0/subnets").with_parent("network"))
        .unwrap();
    Arc::new(manager)
}

pub fn resource(
    schemas: &SchemaManager,
    schema_id: &str,
    data: Value,
) -> Resource {
    let schema = schemas.schema(schema_id).unwrap();
    match data {
        Value::Object(map) => Resource::new(&schema, map).unwrap(),
        other => panic!("resource body must be an object: {}", other),
    }
}

/// A store shared by `members` clients named `p0`, `p1`, ...
pub fn cluster(members: usize) -> (Arc<MemStore>, Vec<Arc<MemSync>>) {
    let store = MemStore::new();
    let clients = (0..members)
        .map(|i| Arc::new(MemSync::new(store.clone(), format!("p{}", i), MASTER_TTL)))
        .collect();
    (store, clients)
}

/// Event-logging database whose commit notifications are published by a
/// worker running until `cancel` fires.
pub fn logging_db(
    schemas: &Arc<SchemaManager>,
    client: Arc<MemSync>,
    cancel: &CancellationToken,
) -> (MemDatabase, Arc<dyn Database>) {
    let mem = MemDatabase::new(schemas.clone());
    let (informer, commits) = CommitInformer::new();
    let worker = CommitInformerWorker::new(commits, client);
    let token = cancel.clone();
    tokio::spawn(async move { worker.run(token).await });

    let db = EventLoggingDatabase::new(Arc::new(mem.clone()), schemas.clone(), Arc::new(informer));
    (mem, Arc::new(db))
}

pub async fn create(
    db: &dyn Database,
    resource: &Resource,
) {
    let mut tx = db.begin().await.unwrap();
    tx.create(resource).await.unwrap();
    tx.commit().await.unwrap();
}

pub async fn update(
    db: &dyn Database,
    resource: &Resource,
) {
    let mut tx = db.begin().await.unwrap();
    tx.update(resource).await.unwrap();
    tx.commit().await.unwrap();
}

pub async fn delete(
    db: &dyn Database,
    schema: &Schema,
    id: &str,
) {
    let mut tx = db.begin().await.unwrap();
    tx.delete(schema, id).await.unwrap();
    tx.commit().await.unwrap();
}

/// Environment remembering every notification.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<(String, Context)>>,
}

impl Recorder {
    pub fn keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(_, c)| c.get("key").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Environment for Recorder {
    async fn handle_event(
        &self,
        event: &str,
        context: &mut Context,
        _tx: Option<&mut dyn Transaction>,
    ) -> Result<()> {
        self.calls.lock().push((event.to_string(), context.clone()));
        Ok(())
    }
}
