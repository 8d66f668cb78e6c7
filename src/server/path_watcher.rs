use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::constants::lock_key;
use crate::constants::NOTIFICATION_EVENT;
use crate::constants::REVISION_CURRENT;
use crate::constants::SYNC_WATCH_REVISION_PREFIX;
use crate::constants::WATCH_LOCK_SUBSYSTEM;
use crate::extension::handle_event;
use crate::extension::Context;
use crate::extension::ExtensionRegistry;
use crate::metrics::PATH_WATCHER_EVENTS;
use crate::metrics::PATH_WATCHER_REVISION;
use crate::sync::CasCondition;
use crate::sync::CoordinationStore;
use crate::sync::SyncEvent;
use crate::utils::async_task::sleep_or_cancelled;
use crate::utils::new_trace_id;
use crate::Error;
use crate::Result;
use crate::SyncError;

const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Runs the notification extension for every change under one watched
/// prefix, in revision order, on the member holding the prefix lock.
///
/// The last processed revision is checkpointed under
/// `/gohan/watch/revision/<path>` with a compare-and-swap, so a member that
/// takes over resumes where the previous holder stopped.
///
/// Lifecycle:
/// ```text
/// BACKOFF --(stagger elapsed)--> ACQUIRING
/// ACQUIRING --(lock ok)--> RUNNING
/// ACQUIRING --(lock failed)--> BACKOFF
/// RUNNING --(lock lost | watch error | cancel)--> BACKOFF
/// ```
pub struct PathWatcher {
    store: Arc<dyn CoordinationStore>,
    extensions: Arc<ExtensionRegistry>,
    path: String,
    priority: u32,
    master_ttl: Duration,
    extension_timeout: Duration,
}

impl PathWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        extensions: Arc<ExtensionRegistry>,
        path: impl Into<String>,
        priority: u32,
        master_ttl: Duration,
        extension_timeout: Duration,
    ) -> Self {
        Self {
            store,
            extensions,
            path: path.into(),
            priority,
            master_ttl,
            extension_timeout,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn stagger(&self) -> Duration {
        self.master_ttl * self.priority
    }

    fn revision_key(&self) -> String {
        format!("{}{}", SYNC_WATCH_REVISION_PREFIX, self.path)
    }

    fn count(
        &self,
        event: &str,
    ) {
        PATH_WATCHER_EVENTS.with_label_values(&[&self.path, event]).inc();
    }

    /// Returns once `cancel` fires.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!(path = %self.path, priority = self.priority, "path watcher started");
        if !sleep_or_cancelled(self.stagger(), &cancel).await {
            return Ok(());
        }

        loop {
            match self.lead(&cancel).await {
                Ok(()) => {}
                Err(Error::Sync(SyncError::LockFailed { .. })) => {
                    debug!(path = %self.path, "watch lock is held by another member");
                }
                Err(e) => {
                    self.count("error");
                    error!("watch on `{}` aborted, retrying...: {}", self.path, e);
                }
            }
            if !sleep_or_cancelled(self.stagger() + RETRY_PAUSE, &cancel).await {
                return Ok(());
            }
        }
    }

    pub(crate) async fn lead(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = lock_key(WATCH_LOCK_SUBSYSTEM, &self.path);
        let lost = self.store.lock(&key, false).await?;
        info!(path = %self.path, "path watcher became active");
        self.count("active");

        let result = self.process(cancel, &lost, &key).await;

        if let Err(e) = self.store.unlock(&key).await {
            warn!("unlocking watch on `{}` failed: {}", self.path, e);
        }
        result
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        lost: &CancellationToken,
        lock: &str,
    ) -> Result<()> {
        let mut previous = self.fetch_stored_revision().await?;
        let from = match previous {
            REVISION_CURRENT => REVISION_CURRENT,
            stored => stored + 1,
        };
        debug!(path = %self.path, from, "watching");

        let watch_cancel = cancel.child_token();
        let _guard = watch_cancel.clone().drop_guard();
        let mut events = match self.store.watch(&self.path, from, watch_cancel).await {
            Ok(events) => events,
            Err(e) => {
                if let Some(compact_revision) = e.compacted_revision() {
                    self.recover_compaction(previous, compact_revision).await;
                }
                return Err(e);
            }
        };

        loop {
            let response = tokio::select! {
                biased;
                _ = lost.cancelled() => {
                    self.count("lock_lost");
                    return Err(SyncError::LockLost { path: lock.to_string() }.into());
                }
                _ = cancel.cancelled() => return Ok(()),
                response = events.recv() => response,
            };

            let event = match response {
                Some(Ok(event)) => event,
                Some(Err(SyncError::Compacted { compact_revision })) => {
                    self.recover_compaction(previous, compact_revision).await;
                    return Err(SyncError::Compacted { compact_revision }.into());
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SyncError::WatchClosed(self.path.clone()).into()),
            };

            self.run_extension(&event).await;
            previous = self.store_revision(previous, &event).await?;
        }
    }

    /// Checkpointed revision, `REVISION_CURRENT` when absent or unparseable.
    async fn fetch_stored_revision(&self) -> Result<i64> {
        let stored = self.store.fetch(&self.revision_key()).await?;
        let revision = stored
            .and_then(|node| node.value.parse::<i64>().ok())
            .unwrap_or(REVISION_CURRENT);
        if revision != REVISION_CURRENT {
            info!("using last seen revision `{}` for watching path `{}`", revision, self.path);
        }
        Ok(revision)
    }

    /// Checkpoints `event.revision` provided the stored value is still
    /// `previous`. A mismatch means another member made progress.
    async fn store_revision(
        &self,
        previous: i64,
        event: &SyncEvent,
    ) -> Result<i64> {
        let key = self.revision_key();
        if self
            .store
            .compare_and_swap(&key, &event.revision.to_string(), &checkpoint_conditions(previous))
            .await?
        {
            PATH_WATCHER_REVISION
                .with_label_values(&[&self.path])
                .set(event.revision as f64);
            return Ok(event.revision);
        }

        self.count("inconsistent");
        self.recover_inconsistency(event).await;
        Err(Error::Inconsistent {
            path: key,
            expected: previous.to_string(),
        })
    }

    /// Re-puts the current value of the event key so the member now leading
    /// the path sees one more change and re-runs its extension.
    async fn recover_inconsistency(
        &self,
        event: &SyncEvent,
    ) {
        let node = match self.store.fetch(&event.key).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(key = %event.key, "key is gone, nothing to re-emit");
                return;
            }
            Err(e) => {
                warn!("inconsistency recovery of `{}` failed to fetch: {}", event.key, e);
                return;
            }
        };

        let conditions = [CasCondition::ValueEquals(node.value.clone())];
        match self
            .store
            .compare_and_swap(&event.key, &node.value, &conditions)
            .await
        {
            Ok(true) => info!(key = %event.key, "re-emitted after inconsistent revision checkpoint"),
            Ok(false) => debug!(key = %event.key, "key changed meanwhile, no re-emit needed"),
            Err(e) => warn!("inconsistency recovery of `{}` failed: {}", event.key, e),
        }
    }

    /// Moves the checkpoint to just below the compaction frontier so the
    /// next watch starts at the oldest revision still available.
    async fn recover_compaction(
        &self,
        previous: i64,
        compact_revision: i64,
    ) {
        self.count("compacted");
        let revision = compact_revision - 1;
        match self
            .store
            .compare_and_swap(&self.revision_key(), &revision.to_string(), &checkpoint_conditions(previous))
            .await
        {
            Ok(true) => warn!(
                "watch on `{}` fell behind compaction, resuming from revision {}",
                self.path, compact_revision
            ),
            Ok(false) => debug!(path = %self.path, "compaction already recovered by another member"),
            Err(e) => warn!("compaction recovery of `{}` failed: {}", self.path, e),
        }
    }

    async fn run_extension(
        &self,
        event: &SyncEvent,
    ) {
        let Some((name, env)) = self.extensions.for_key(&event.key) else {
            return;
        };

        let mut context = Context::new();
        context.insert("action".to_string(), Value::from(event.action.as_str()));
        context.insert("data".to_string(), Value::Object(event.data.clone()));
        context.insert("key".to_string(), Value::from(event.key.clone()));
        context.insert("revision".to_string(), Value::from(event.revision));
        context.insert("trace_id".to_string(), Value::from(new_trace_id()));

        let started = Instant::now();
        let result = handle_event(
            env.as_ref(),
            NOTIFICATION_EVENT,
            &mut context,
            None,
            Some(self.extension_timeout),
        )
        .await;
        debug!(
            path = %self.path,
            extension = name,
            key = %event.key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "notification handled"
        );

        match result {
            Ok(()) => self.count(event.action.as_str()),
            Err(e) => {
                self.count("extension_error");
                error!(
                    "extension error on `{}`, last processed event may be lost: {}",
                    self.path, e
                );
            }
        }
    }
}

/// No precondition before the first checkpoint.
fn checkpoint_conditions(previous: i64) -> Vec<CasCondition> {
    match previous {
        REVISION_CURRENT => vec![],
        previous => vec![CasCondition::ValueEquals(previous.to_string())],
    }
}
