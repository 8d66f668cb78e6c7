use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::PathWatcher;
use crate::constants::PROCESS_PATH_PREFIX;
use crate::constants::REVISION_CURRENT;
use crate::extension::ExtensionRegistry;
use crate::sync::CoordinationStore;
use crate::sync::EventAction;
use crate::utils::async_task::sleep_or_cancelled;
use crate::utils::async_task::spawn_task;
use crate::Result;
use crate::SyncError;

/// Priority of the watch key at `index` for the member at `position` of a
/// cluster of `size` members. Priority 0 starts first.
pub fn watch_priority(
    position: usize,
    index: usize,
    size: usize,
) -> u32 {
    ((position + size - (index % size)) % size) as u32
}

/// Path watchers started for one view of the cluster membership.
struct Generation {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Generation {
    async fn stop(self) {
        self.cancel.cancel();
        join_all(self.handles).await;
    }
}

/// Registers this member under `/gohan/cluster/process` and keeps one
/// `PathWatcher` per watched key running, with priorities recomputed
/// whenever a member joins or leaves.
pub struct SyncWatcher {
    store: Arc<dyn CoordinationStore>,
    extensions: Arc<ExtensionRegistry>,
    keys: Vec<String>,
    master_ttl: Duration,
    extension_timeout: Duration,
    backoff: Duration,
}

impl SyncWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        extensions: Arc<ExtensionRegistry>,
        keys: Vec<String>,
        master_ttl: Duration,
        extension_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            extensions,
            keys,
            master_ttl,
            extension_timeout,
            backoff,
        }
    }

    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.register(&cancel).await {
                error!("process watch interrupted: {}", e);
            }
            if !sleep_or_cancelled(self.backoff, &cancel).await {
                return Ok(());
            }
        }
    }

    async fn register(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = format!("{}/{}", PROCESS_PATH_PREFIX, self.store.process_id());
        let lost = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            lost = self.store.lock(&key, true) => lost?,
        };
        info!(key, "process registered");

        let result = self.watch_members(cancel, &lost, &key).await;

        if let Err(e) = self.store.unlock(&key).await {
            warn!("unregistering process {} failed: {}", key, e);
        }
        result
    }

    async fn watch_members(
        &self,
        cancel: &CancellationToken,
        lost: &CancellationToken,
        me: &str,
    ) -> Result<()> {
        let watch_cancel = cancel.child_token();
        let _guard = watch_cancel.clone().drop_guard();
        let mut events = self
            .store
            .watch(PROCESS_PATH_PREFIX, REVISION_CURRENT, watch_cancel)
            .await?;

        let mut members: Vec<String> = vec![];
        let mut generation: Option<Generation> = None;

        let result = loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = lost.cancelled() => break Err(SyncError::LockLost { path: me.to_string() }.into()),
                response = events.recv() => response,
            };
            let event = match response {
                Some(Ok(event)) => event,
                Some(Err(e)) => break Err(e.into()),
                None => break Err(SyncError::WatchClosed(PROCESS_PATH_PREFIX.to_string()).into()),
            };
            debug!("cluster change detected: {} process {}", event.action, event.key);

            if let Some(previous) = generation.take() {
                previous.stop().await;
            }

            match event.action {
                EventAction::Delete => {
                    members.retain(|m| *m != event.key);
                    if event.key == me {
                        break Err(SyncError::LockLost { path: me.to_string() }.into());
                    }
                }
                EventAction::Get | EventAction::Set => {
                    if !members.contains(&event.key) {
                        members.push(event.key.clone());
                        members.sort();
                    }
                }
            }

            match members.iter().position(|m| m == me) {
                Some(position) => {
                    debug!(
                        "current cluster consists of following processes: {:?}, my position: {}",
                        members, position
                    );
                    generation = Some(self.start_watches(members.len(), position));
                }
                None => debug!("own process not listed yet in {:?}", members),
            }
        };

        if let Some(current) = generation.take() {
            current.stop().await;
        }
        result
    }

    fn start_watches(
        &self,
        size: usize,
        position: usize,
    ) -> Generation {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.keys.len());

        for (index, path) in self.keys.iter().enumerate() {
            let priority = watch_priority(position, index, size);
            debug!("sync watch priority of `{}`: `{}`", path, priority);

            let watcher = PathWatcher::new(
                self.store.clone(),
                self.extensions.clone(),
                path.clone(),
                priority,
                self.master_ttl,
                self.extension_timeout,
            );
            let cancel = cancel.clone();
            spawn_task(
                &format!("path watcher {}", path),
                move || async move { watcher.run(cancel).await },
                Some(&mut handles),
            );
        }
        Generation { cancel, handles }
    }
}
