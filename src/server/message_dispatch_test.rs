use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::timeout;

use super::message_dispatch::normalize_key;
use super::MessageDispatch;
use crate::Error;

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[test]
fn test_normalize_key() {
    assert_eq!(normalize_key("/a//b/"), "/a/b");
    assert_eq!(normalize_key("a/b"), "/a/b");
    assert_eq!(normalize_key("///"), "/");
}

/// # Case 1: broadcast of an ancestor wakes the waiter
#[tokio::test(start_paused = true)]
async fn test_wait_case1() {
    let dispatch = Arc::new(MessageDispatch::new());
    let waiter = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.wait("/a/b/c").await })
    };
    settle().await;

    dispatch.broadcast("/a").await.unwrap();

    let r = timeout(Duration::from_secs(1), waiter).await;
    assert!(matches!(r, Ok(Ok(Ok(())))));
}

/// # Case 2: broadcast of a descendant does not wake the waiter
#[tokio::test(start_paused = true)]
async fn test_wait_case2() {
    let dispatch = Arc::new(MessageDispatch::new());
    let waiter = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.wait("/a/b").await })
    };
    settle().await;

    dispatch.broadcast("/a/b/c").await.unwrap();
    dispatch.broadcast("/a/bc").await.unwrap();
    settle().await;
    assert!(!waiter.is_finished());

    dispatch.broadcast("//a/b/").await.unwrap();
    let r = timeout(Duration::from_secs(1), waiter).await;
    assert!(matches!(r, Ok(Ok(Ok(())))));
}

#[tokio::test(start_paused = true)]
async fn every_waiter_wakes_once_per_broadcast() {
    let dispatch = Arc::new(MessageDispatch::new());
    let woken = Arc::new(AtomicUsize::new(0));
    let mut waiters = vec![];
    for _ in 0..3 {
        let dispatch = dispatch.clone();
        let woken = woken.clone();
        waiters.push(tokio::spawn(async move {
            dispatch.wait("/x/y").await.unwrap();
            woken.fetch_add(1, Ordering::SeqCst);
        }));
    }
    settle().await;

    dispatch.broadcast("/x").await.unwrap();
    for w in waiters {
        w.await.unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 3);
}

/// # Case 1: a changed hash returns immediately
#[tokio::test]
async fn test_get_or_wait_case1() {
    let dispatch = MessageDispatch::new();
    let (value, hash) = dispatch
        .get_or_wait("/r", "old", || async { Ok("v1".to_string()) }, |v| format!("h-{}", v))
        .await
        .unwrap();
    assert_eq!(value, "v1");
    assert_eq!(hash, "h-v1");
}

/// # Case 2: an unchanged hash waits for a matching broadcast, then re-fetches
#[tokio::test(start_paused = true)]
async fn test_get_or_wait_case2() {
    let dispatch = Arc::new(MessageDispatch::new());
    let fetches = Arc::new(AtomicUsize::new(0));

    let reader = {
        let dispatch = dispatch.clone();
        let fetches = fetches.clone();
        tokio::spawn(async move {
            dispatch
                .get_or_wait(
                    "/r/1",
                    "h-0",
                    || {
                        let n = fetches.fetch_add(1, Ordering::SeqCst);
                        async move { Ok(n) }
                    },
                    |n| format!("h-{}", n),
                )
                .await
        })
    };
    settle().await;
    assert!(!reader.is_finished());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    dispatch.broadcast("/r").await.unwrap();
    let (value, hash) = reader.await.unwrap().unwrap();
    assert_eq!(value, 1);
    assert_eq!(hash, "h-1");
}

/// # Case 3: fetch errors are returned
#[tokio::test]
async fn test_get_or_wait_case3() {
    let dispatch = MessageDispatch::new();
    let r = dispatch
        .get_or_wait(
            "/r",
            "",
            || async { Err::<String, _>(Error::Validation("bad".into())) },
            |v| v.clone(),
        )
        .await;
    assert!(matches!(r, Err(Error::Validation(_))));
}

#[tokio::test(start_paused = true)]
async fn close_wakes_waiters_and_rejects_new_calls() {
    let dispatch = Arc::new(MessageDispatch::new());
    let waiter = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.wait("/a").await })
    };
    settle().await;

    dispatch.close().await;
    assert!(waiter.await.unwrap().is_ok());

    assert!(matches!(dispatch.wait("/a").await, Err(Error::DispatchClosed)));
    assert!(matches!(dispatch.broadcast("/a").await, Err(Error::DispatchClosed)));
}
