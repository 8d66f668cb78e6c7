use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::db::Database;
use crate::db::MemDatabase;
use crate::db::Transaction;
use crate::schema::Resource;
use crate::schema::Schema;
use crate::schema::SchemaManager;
use crate::schema::SyncMetadata;
use crate::sync::MemStore;
use crate::server::CommitNotifier;
use crate::server::EventLoggingDatabase;
use crate::server::MockCommitNotifier;
use crate::sync::MemSync;

pub(crate) fn enable_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Schemas covering every sync flavour:
/// - `network`: state-versioned
/// - `subnet`: child of network, not state-versioned
/// - `port`: state-versioned with a sync key template
/// - `device`: mirrored without the `/config` prefix
/// - `config_entry`: plain sync of the `content` property
/// - `wrapped_entry`: `content` property wrapped with its version
/// - `raw_entry`: plain sync of the whole body
/// - `hidden`: nosync
/// - `base`: abstract
pub(crate) fn fixture_schemas() -> Arc<SchemaManager> {
    let mut manager = SchemaManager::new();
    let schemas = vec![
        Schema::new("network", "networks", "/v2.0/networks").with_metadata(SyncMetadata {
            state_versioning: true,
            ..Default::default()
        }),
        Schema::new("subnet", "subnets", "/v2.0/subnets").with_parent("network"),
        Schema::new("port", "ports", "/v2.0/ports").with_metadata(SyncMetadata {
            state_versioning: true,
            sync_key_template: Some("/agents/{{agent_id}}/ports/{{id}}".to_string()),
            ..Default::default()
        }),
        Schema::new("device", "devices", "/v2.0/devices").with_metadata(SyncMetadata {
            skip_config_prefix: true,
            ..Default::default()
        }),
        Schema::new("config_entry", "config_entries", "/v2.0/config_entries").with_metadata(SyncMetadata {
            sync_plain: true,
            sync_property: Some("content".to_string()),
            ..Default::default()
        }),
        Schema::new("wrapped_entry", "wrapped_entries", "/v2.0/wrapped_entries").with_metadata(SyncMetadata {
            sync_property: Some("content".to_string()),
            ..Default::default()
        }),
        Schema::new("raw_entry", "raw_entries", "/v2.0/raw_entries").with_metadata(SyncMetadata {
            sync_plain: true,
            ..Default::default()
        }),
        Schema::new("hidden", "hiddens", "/v2.0/hiddens").with_metadata(SyncMetadata {
            nosync: true,
            ..Default::default()
        }),
        Schema::new("base", "bases", "/v2.0/bases").abstract_schema(),
    ];
    for schema in schemas {
        manager.register(schema).unwrap();
    }
    Arc::new(manager)
}

pub(crate) fn resource(
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
pub(crate) fn mem_cluster(members: usize) -> (Arc<MemStore>, Vec<Arc<MemSync>>) {
    let store = MemStore::new();
    let clients = (0..members)
        .map(|i| Arc::new(MemSync::new(store.clone(), format!("p{}", i), Duration::from_secs(10))))
        .collect();
    (store, clients)
}

/// Notifier accepting any number of notifications.
pub(crate) fn noop_notifier() -> Arc<dyn CommitNotifier> {
    let mut notifier = MockCommitNotifier::new();
    notifier.expect_notify().return_const(());
    Arc::new(notifier)
}

/// In-memory database and an event-logging view of it.
pub(crate) fn logging_db(schemas: &Arc<SchemaManager>) -> (MemDatabase, Arc<dyn Database>) {
    let mem = MemDatabase::new(schemas.clone());
    let db = EventLoggingDatabase::new(Arc::new(mem.clone()), schemas.clone(), noop_notifier());
    (mem, Arc::new(db))
}

pub(crate) async fn create(
    db: &dyn Database,
    resource: &Resource,
) {
    let mut tx = db.begin().await.unwrap();
    tx.create(resource).await.unwrap();
    tx.commit().await.unwrap();
}

pub(crate) async fn update(
    db: &dyn Database,
    resource: &Resource,
) {
    let mut tx = db.begin().await.unwrap();
    tx.update(resource).await.unwrap();
    tx.commit().await.unwrap();
}

pub(crate) async fn delete(
    db: &dyn Database,
    schema: &Schema,
    id: &str,
) {
    let mut tx = db.begin().await.unwrap();
    tx.delete(schema, id).await.unwrap();
    tx.commit().await.unwrap();
}
