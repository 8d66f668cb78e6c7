//! A second member takes the sync lock over once the leader stops, and
//! drains what the leader left behind.

use std::time::Duration;

use gohan::config::ScopedRetryConfig;
use gohan::config::SyncConfig;
use gohan::server::SyncWriter;
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::common::cluster;
use crate::common::create;
use crate::common::logging_db;
use crate::common::resource;
use crate::common::schemas;

#[tokio::test(start_paused = true)]
async fn test_failover_case1() {
    let schemas = schemas();
    let (store, clients) = cluster(2);
    let cancel = CancellationToken::new();
    let (mem, db) = logging_db(&schemas, clients[0].clone(), &cancel);

    let config = SyncConfig {
        backoff_ms: 100,
        ..Default::default()
    };
    let leader_cancel = CancellationToken::new();
    let leader = {
        let writer = SyncWriter::new(
            clients[0].clone(),
            db.clone(),
            schemas.clone(),
            config.clone(),
            ScopedRetryConfig::default(),
        );
        let token = leader_cancel.clone();
        tokio::spawn(async move { writer.run(token).await })
    };
    sleep(Duration::from_millis(100)).await;
    let follower = {
        let writer = SyncWriter::new(
            clients[1].clone(),
            db.clone(),
            schemas.clone(),
            config,
            ScopedRetryConfig::default(),
        );
        let token = cancel.clone();
        tokio::spawn(async move { writer.run(token).await })
    };
    sleep(Duration::from_millis(100)).await;

    create(db.as_ref(), &resource(&schemas, "subnet", json!({"id": "s1"}))).await;
    sleep(Duration::from_millis(100)).await;
    assert!(store.value("/config/v2.0/subnets/s1").is_some());

    leader_cancel.cancel();
    leader.await.unwrap().unwrap();

    create(db.as_ref(), &resource(&schemas, "subnet", json!({"id": "s2"}))).await;
    sleep(Duration::from_secs(1)).await;
    assert!(store.value("/config/v2.0/subnets/s2").is_some());
    assert!(mem.events().is_empty());

    cancel.cancel();
    follower.await.unwrap().unwrap();
}
