//! Agent state reports written to the coordination store reconcile the
//! resource state; stale reports are ignored.

use std::sync::Arc;
use std::time::Duration;

use gohan::config::ScopedRetryConfig;
use gohan::db::MemDatabase;
use gohan::extension::ExtensionRegistry;
use gohan::schema::ResourceState;
use gohan::server::StateWatcher;
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::common::cluster;
use crate::common::create;
use crate::common::resource;
use crate::common::schemas;

#[tokio::test(start_paused = true)]
async fn test_state_report_case1() {
    let schemas = schemas();
    let (store, clients) = cluster(1);
    let mem = MemDatabase::new(schemas.clone());
    create(&mem, &resource(&schemas, "network", json!({"id": "n1"}))).await;

    let watcher = StateWatcher::new(
        clients[0].clone(),
        Arc::new(mem.clone()),
        schemas,
        Arc::new(ExtensionRegistry::new()),
        Duration::from_secs(1),
        ScopedRetryConfig::default(),
    );
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };
    sleep(Duration::from_millis(100)).await;

    store.put(
        "/state/v2.0/networks/n1",
        r#"{"version":1,"state":"active","error":""}"#,
        None,
    );
    sleep(Duration::from_millis(100)).await;
    let expected = ResourceState {
        config_version: 1,
        state_version: 1,
        state: "active".to_string(),
        ..Default::default()
    };
    assert_eq!(mem.resource_state("network", "n1").unwrap(), expected);

    store.put(
        "/state/v2.0/networks/n1",
        r#"{"version":0,"state":"stale","error":"old"}"#,
        None,
    );
    sleep(Duration::from_millis(100)).await;
    assert_eq!(mem.resource_state("network", "n1").unwrap(), expected);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
