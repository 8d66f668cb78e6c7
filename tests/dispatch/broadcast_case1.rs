//! Broadcasts wake readers of the broadcast key and of every key below it.

use std::sync::Arc;
use std::time::Duration;

use gohan::server::response_etag;
use gohan::server::MessageDispatch;
use serde_json::json;
use tokio::time::sleep;
use tokio::time::timeout;

#[tokio::test]
async fn test_broadcast_case1() {
    let dispatch = Arc::new(MessageDispatch::new());

    let waiter = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.wait("/a/b/c").await })
    };
    sleep(Duration::from_millis(20)).await;
    dispatch.broadcast("/a").await.unwrap();

    timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_broadcast_case2() {
    let dispatch = Arc::new(MessageDispatch::new());

    let waiter = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.wait("/a/b").await })
    };
    sleep(Duration::from_millis(20)).await;
    dispatch.broadcast("/a/b/c").await.unwrap();

    assert!(timeout(Duration::from_millis(200), waiter).await.is_err());
}

#[tokio::test]
async fn get_or_wait_returns_changed_content_at_once() {
    let dispatch = MessageDispatch::new();
    let stale = response_etag(&json!({"name": "red"}));

    let (value, hash) = dispatch
        .get_or_wait(
            "/v2.0/networks/n1",
            &stale,
            || async { Ok(json!({"name": "blue"})) },
            response_etag,
        )
        .await
        .unwrap();
    assert_eq!(value, json!({"name": "blue"}));
    assert_eq!(hash, response_etag(&json!({"name": "blue"})));
}
