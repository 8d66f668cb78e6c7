use serde_json::json;

use super::resync;
use crate::config::ScopedRetryConfig;
use crate::config::SyncConfig;
use crate::test_utils::create;
use crate::test_utils::fixture_schemas;
use crate::test_utils::logging_db;
use crate::test_utils::mem_cluster;
use crate::test_utils::resource;

#[tokio::test]
async fn resync_re_emits_every_synced_resource() {
    let schemas = fixture_schemas();
    let (mem, db) = logging_db(&schemas);
    let (store, clients) = mem_cluster(1);

    // Written behind the event logger: nothing is queued
    create(&mem, &resource(&schemas, "network", json!({"id": "n1"}))).await;
    create(&mem, &resource(&schemas, "subnet", json!({"id": "s1"}))).await;
    create(&mem, &resource(&schemas, "device", json!({"id": "d1"}))).await;
    create(&mem, &resource(&schemas, "hidden", json!({"id": "h1"}))).await;
    assert!(mem.events().is_empty());

    let config = SyncConfig {
        batch_limit: 2,
        ..Default::default()
    };
    let total = resync(db, clients[0].clone(), schemas, config, ScopedRetryConfig::default())
        .await
        .unwrap();

    assert_eq!(total, 3);
    assert_eq!(
        store.value("/config/v2.0/networks/n1").unwrap(),
        r#"{"body":"{\"id\":\"n1\"}","version":1}"#
    );
    assert!(store.value("/config/v2.0/subnets/s1").is_some());
    assert!(store.value("/v2.0/devices/d1").is_some());
    assert!(store.value("/config/v2.0/hiddens/h1").is_none());
    assert!(mem.events().is_empty());
}

#[tokio::test]
async fn resync_of_an_empty_database_syncs_nothing() {
    let schemas = fixture_schemas();
    let (_mem, db) = logging_db(&schemas);
    let (_store, clients) = mem_cluster(1);

    let total = resync(
        db,
        clients[0].clone(),
        schemas,
        SyncConfig::default(),
        ScopedRetryConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(total, 0);
}
