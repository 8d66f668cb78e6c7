//! The path watcher checkpoints every processed revision and, when the
//! checkpoint moved under it, re-emits the event key and resumes from the
//! stored revision.

use std::sync::Arc;
use std::time::Duration;

use gohan::constants::SYNC_WATCH_REVISION_PREFIX;
use gohan::extension::ExtensionRegistry;
use gohan::server::PathWatcher;
use gohan::sync::MemStore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::common::cluster;
use crate::common::Recorder;
use crate::common::MASTER_TTL;

fn stored_revision(store: &MemStore) -> i64 {
    store
        .value(&format!("{}/foo", SYNC_WATCH_REVISION_PREFIX))
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1)
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_case1() {
    let (store, clients) = cluster(1);
    let revision_key = format!("{}/foo", SYNC_WATCH_REVISION_PREFIX);
    let start = store.put("/foo/seed", "0", None);
    store.put(&revision_key, &start.to_string(), None);

    let recorder = Arc::new(Recorder::default());
    let mut registry = ExtensionRegistry::new();
    registry.register_event("foo", recorder.clone());

    let watcher = PathWatcher::new(
        clients[0].clone(),
        Arc::new(registry),
        "/foo",
        0,
        MASTER_TTL,
        Duration::from_secs(30),
    );
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };
    sleep(Duration::from_millis(100)).await;

    let mut last = start;
    for key in ["/foo/a", "/foo/b", "/foo/c"] {
        let revision = store.put(key, "1", None);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(stored_revision(&store), revision);
        last = revision;
    }
    assert_eq!(recorder.keys(), vec!["/foo/a", "/foo/b", "/foo/c"]);

    // Another member rewound the checkpoint: the next CAS expects `last`
    store.put(&revision_key, &start.to_string(), None);
    assert_ne!(stored_revision(&store), last);
    let emitted = store.put("/foo/d", "2", None);
    sleep(Duration::from_secs(3)).await;

    // Re-put with the same value at a newer revision, then replayed
    let reemitted = store.get("/foo/d").unwrap();
    assert_eq!(reemitted.value, "2");
    assert!(reemitted.revision > emitted);
    assert_eq!(stored_revision(&store), reemitted.revision);
    assert_eq!(recorder.keys().last().map(String::as_str), Some("/foo/d"));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
