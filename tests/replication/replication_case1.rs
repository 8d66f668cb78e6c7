//! Create, update and delete of a state-versioned resource travel through
//! the event table into the coordination store.

use gohan::config::ScopedRetryConfig;
use gohan::config::SyncConfig;
use gohan::db::EventType;
use gohan::server::SyncWriter;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::cluster;
use crate::common::create;
use crate::common::delete;
use crate::common::enable_logger;
use crate::common::logging_db;
use crate::common::resource;
use crate::common::schemas;
use crate::common::update;

const KEY: &str = "/config/v2.0/networks/n1";

#[tokio::test]
async fn test_replication_case1() {
    enable_logger();
    let schemas = schemas();
    let (store, clients) = cluster(1);
    let cancel = CancellationToken::new();
    let (mem, db) = logging_db(&schemas, clients[0].clone(), &cancel);
    let writer = SyncWriter::new(
        clients[0].clone(),
        db.clone(),
        schemas.clone(),
        SyncConfig::default(),
        ScopedRetryConfig::default(),
    );

    // 1. Create
    create(db.as_ref(), &resource(&schemas, "network", json!({"id": "n1", "name": "red"}))).await;
    let events = mem.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, 1);
    assert_eq!(events[0].event_type, EventType::Create);
    assert_eq!(events[0].version, 1);

    assert_eq!(writer.sync_events().await.unwrap(), 1);
    assert_eq!(
        store.value(KEY).unwrap(),
        r#"{"body":"{\"id\":\"n1\",\"name\":\"red\"}","version":1}"#
    );
    assert!(mem.events().is_empty());

    // 2. Update
    update(db.as_ref(), &resource(&schemas, "network", json!({"id": "n1", "name": "blue"}))).await;
    let events = mem.events();
    assert_eq!(events[0].id, 2);
    assert_eq!(events[0].event_type, EventType::Update);
    assert_eq!(events[0].version, 2);

    assert_eq!(writer.sync_events().await.unwrap(), 1);
    assert_eq!(
        store.value(KEY).unwrap(),
        r#"{"body":"{\"id\":\"n1\",\"name\":\"blue\"}","version":2}"#
    );
    assert!(mem.events().is_empty());

    // 3. Delete, with agent reports present
    store.put("/state/v2.0/networks/n1", r#"{"version":2}"#, None);
    store.put("/monitoring/v2.0/networks/n1", r#"{"version":2,"monitoring":"up"}"#, None);
    delete(db.as_ref(), &schemas.schema("network").unwrap(), "n1").await;
    let events = mem.events();
    assert_eq!(events[0].id, 3);
    assert_eq!(events[0].event_type, EventType::Delete);
    assert_eq!(events[0].version, 3);

    assert_eq!(writer.sync_events().await.unwrap(), 1);
    assert!(store.value(KEY).is_none());
    assert!(store.value("/state/v2.0/networks/n1").is_none());
    assert!(store.value("/monitoring/v2.0/networks/n1").is_none());
    assert!(mem.events().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn unversioned_updates_carry_version_zero() {
    let schemas = schemas();
    let (store, clients) = cluster(1);
    let cancel = CancellationToken::new();
    let (mem, db) = logging_db(&schemas, clients[0].clone(), &cancel);
    let writer = SyncWriter::new(
        clients[0].clone(),
        db.clone(),
        schemas.clone(),
        SyncConfig::default(),
        ScopedRetryConfig::default(),
    );

    create(db.as_ref(), &resource(&schemas, "subnet", json!({"id": "s1"}))).await;
    update(db.as_ref(), &resource(&schemas, "subnet", json!({"id": "s1", "cidr": "10.0.0.0/24"}))).await;
    let versions: Vec<i64> = mem.events().iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 0]);

    assert_eq!(writer.sync_events().await.unwrap(), 2);
    assert_eq!(
        store.value("/config/v2.0/subnets/s1").unwrap(),
        r#"{"body":"{\"cidr\":\"10.0.0.0/24\",\"id\":\"s1\"}","version":0}"#
    );

    cancel.cancel();
}
