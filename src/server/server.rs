//! Supervisor wiring the replication plane of one member.
//!
//! The [`Server`] stacks the database decorators every handler writes
//! through and spawns the background loops:
//! - commit informer worker: publishes committed event ids
//! - sync writer: mirrors the event table into the coordination store
//! - state watcher: applies agent state and monitoring reports
//! - sync watcher: cluster registration and path watchers
//! - long poll watcher: wakes long-poll waiters of every member
//!
//! ## Example
//! ```ignore
//! let cancel = CancellationToken::new();
//! let mut server = Server::new(settings, schemas, store, backend, extensions);
//! let handles = server.start(&cancel)?;
//! // ...
//! cancel.cancel();
//! futures::future::join_all(handles).await;
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::resync;
use super::CommitInformer;
use super::CommitInformerWorker;
use super::EventLoggingDatabase;
use super::LongPollDatabase;
use super::LongPollWatcher;
use super::MessageDispatch;
use super::StateWatcher;
use super::SyncWatcher;
use super::SyncWriter;
use crate::config::Settings;
use crate::db::Database;
use crate::db::RetryPolicy;
use crate::db::RetryableDatabase;
use crate::extension::ExtensionRegistry;
use crate::schema::SchemaManager;
use crate::sync::CoordinationStore;
use crate::utils::async_task::spawn_task;
use crate::Error;
use crate::Result;

pub struct Server {
    settings: Arc<Settings>,
    schemas: Arc<SchemaManager>,
    store: Arc<dyn CoordinationStore>,
    db: Arc<dyn Database>,
    extensions: Arc<ExtensionRegistry>,
    dispatch: Arc<MessageDispatch>,
    commits: Option<mpsc::Receiver<i64>>,
}

impl Server {
    /// Wraps `backend` as retryable, then long-poll notifying, then event
    /// logging. Handlers must write through [`Server::db`]. Path watchers
    /// only dispatch to the events listed in `watch.events`.
    pub fn new(
        settings: Settings,
        schemas: Arc<SchemaManager>,
        store: Arc<dyn CoordinationStore>,
        backend: Arc<dyn Database>,
        mut extensions: ExtensionRegistry,
    ) -> Self {
        extensions.restrict_events(&settings.watch.events);
        let (informer, commits) = CommitInformer::new();

        let policy = RetryPolicy::from_config(&settings.database.transaction_retries);
        let retryable: Arc<dyn Database> = Arc::new(RetryableDatabase::new(backend, policy));
        let long_poll: Arc<dyn Database> = Arc::new(LongPollDatabase::new(retryable, store.clone()));
        let db: Arc<dyn Database> =
            Arc::new(EventLoggingDatabase::new(long_poll, schemas.clone(), Arc::new(informer)));

        Self {
            settings: Arc::new(settings),
            schemas,
            store,
            db,
            extensions: Arc::new(extensions),
            dispatch: Arc::new(MessageDispatch::new()),
            commits: Some(commits),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn schemas(&self) -> &Arc<SchemaManager> {
        &self.schemas
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Event-logging database view.
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn dispatch(&self) -> &Arc<MessageDispatch> {
        &self.dispatch
    }

    /// Spawns every background loop. All of them stop once `cancel` fires.
    ///
    /// # Errors
    /// Returns `Error::Fatal` when called a second time.
    pub fn start(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let commits = self
            .commits
            .take()
            .ok_or_else(|| Error::Fatal("server already started".to_string()))?;
        let mut handles = vec![];
        let settings = &self.settings;
        let retries = settings.database.scoped_retries;

        let worker = CommitInformerWorker::new(commits, self.store.clone());
        let token = cancel.clone();
        spawn_task("commit informer", move || worker.run(token), Some(&mut handles));

        let writer = SyncWriter::new(
            self.store.clone(),
            self.db.clone(),
            self.schemas.clone(),
            settings.sync.clone(),
            retries,
        );
        let token = cancel.clone();
        spawn_task("sync writer", move || async move { writer.run(token).await }, Some(&mut handles));

        let state_watcher = StateWatcher::new(
            self.store.clone(),
            self.db.clone(),
            self.schemas.clone(),
            self.extensions.clone(),
            settings.state_watch.backoff(),
            retries,
        );
        let token = cancel.clone();
        spawn_task(
            "state watcher",
            move || async move { state_watcher.run(token).await },
            Some(&mut handles),
        );

        if settings.watch.keys.is_empty() {
            info!("no watch keys configured, path watchers disabled");
        } else {
            let sync_watcher = SyncWatcher::new(
                self.store.clone(),
                self.extensions.clone(),
                settings.watch.keys.clone(),
                settings.cluster.master_ttl(),
                settings.watch.extension_timeout(),
                settings.watch.backoff(),
            );
            let token = cancel.clone();
            spawn_task(
                "sync watcher",
                move || async move { sync_watcher.run(token).await },
                Some(&mut handles),
            );
        }

        let long_poll = LongPollWatcher::new(self.store.clone(), self.dispatch.clone(), settings.watch.backoff());
        let token = cancel.clone();
        spawn_task(
            "long poll watcher",
            move || async move { long_poll.run(token).await },
            Some(&mut handles),
        );

        let dispatch = self.dispatch.clone();
        let token = cancel.clone();
        spawn_task(
            "message dispatch",
            move || async move {
                token.cancelled().await;
                dispatch.close().await;
                Ok(())
            },
            Some(&mut handles),
        );

        info!(process_id = %self.store.process_id(), "replication plane started");
        Ok(handles)
    }

    /// Re-emits every synced resource and drains the event table.
    pub async fn resync(&self) -> Result<usize> {
        resync(
            self.db.clone(),
            self.store.clone(),
            self.schemas.clone(),
            self.settings.sync.clone(),
            self.settings.database.scoped_retries,
        )
        .await
    }
}
