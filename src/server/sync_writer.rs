use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::ScopedRetryConfig;
use crate::config::SyncConfig;
use crate::constants::lock_key;
use crate::constants::CONFIG_PREFIX;
use crate::constants::MONITORING_PREFIX;
use crate::constants::REVISION_CURRENT;
use crate::constants::STATE_PREFIX;
use crate::constants::SYNC_KEY_TX_COMMITTED;
use crate::constants::SYNC_LOCK_SUBSYSTEM;
use crate::db::within_tx;
use crate::db::Database;
use crate::db::Event;
use crate::db::EventType;
use crate::db::TxOptions;
use crate::metrics::SYNC_OPS;
use crate::metrics::SYNC_WRITER_EVENTS;
use crate::schema::Schema;
use crate::schema::SchemaManager;
use crate::sync::CoordinationStore;
use crate::utils::async_task::sleep_or_cancelled;
use crate::Error;
use crate::Result;
use crate::SyncError;

/// Cluster-wide single writer mirroring the event table into the
/// coordination store.
///
/// Only the member holding the sync lock drains. A drain runs at startup,
/// on every poll tick and whenever a commit notification is observed. Event
/// rows are deleted only after their coordination store write succeeded, so
/// a write may be repeated but never lost.
pub struct SyncWriter {
    store: Arc<dyn CoordinationStore>,
    db: Arc<dyn Database>,
    schemas: Arc<SchemaManager>,
    config: SyncConfig,
    retries: ScopedRetryConfig,
}

impl SyncWriter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        db: Arc<dyn Database>,
        schemas: Arc<SchemaManager>,
        config: SyncConfig,
        retries: ScopedRetryConfig,
    ) -> Self {
        Self {
            store,
            db,
            schemas,
            config,
            retries,
        }
    }

    /// Leader election and drain loop. Returns only when `cancel` fires.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.lead(&cancel).await {
                error!("sync writer was interrupted: {}", e);
            }
            if !sleep_or_cancelled(self.config.backoff(), &cancel).await {
                return Ok(());
            }
        }
    }

    pub(crate) async fn lead(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = lock_key(SYNC_LOCK_SUBSYSTEM, "");
        let lost = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            lost = self.store.lock(&key, true) => lost?,
        };
        info!("sync writer became the leader");
        SYNC_WRITER_EVENTS.with_label_values(&["leader"]).inc();

        let result = self.drain_loop(cancel, &lost, &key).await;

        match timeout(self.config.unlock_timeout(), self.store.unlock(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("sync writer: unlocking failed: {}", e),
            Err(_) => warn!("sync writer: unlocking timed out"),
        }
        result
    }

    async fn drain_loop(
        &self,
        cancel: &CancellationToken,
        lost: &CancellationToken,
        key: &str,
    ) -> Result<()> {
        let watch_cancel = cancel.child_token();
        let _guard = watch_cancel.clone().drop_guard();
        let mut trigger = self
            .store
            .watch(SYNC_KEY_TX_COMMITTED, REVISION_CURRENT, watch_cancel)
            .await?;

        // First tick fires immediately and performs the startup drain
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = lost.cancelled() => {
                    SYNC_WRITER_EVENTS.with_label_values(&["locks_lost"]).inc();
                    return Err(SyncError::LockLost { path: key.to_string() }.into());
                }
                _ = cancel.cancelled() => return Ok(()),
                response = trigger.recv() => match response {
                    Some(Ok(event)) => {
                        debug!(value = %event.value, "commit notification observed");
                        SYNC_WRITER_EVENTS.with_label_values(&["wake_up.on_trigger"]).inc();
                        self.sync_events().await?;
                    }
                    Some(Err(e)) => {
                        SYNC_WRITER_EVENTS.with_label_values(&["event_error"]).inc();
                        return Err(e.into());
                    }
                    None => return Err(SyncError::WatchClosed(SYNC_KEY_TX_COMMITTED.to_string()).into()),
                },
                _ = ticker.tick() => {
                    SYNC_WRITER_EVENTS.with_label_values(&["wake_up.on_timer"]).inc();
                    self.sync_events().await?;
                }
            }
        }
    }

    /// Runs one drain: reads up to `batch_limit` events oldest first and
    /// mirrors them one by one. Stops at the first failure, leaving that
    /// event and every later one in the table.
    ///
    /// Returns the number of events synced.
    #[instrument(skip_all)]
    pub async fn sync_events(&self) -> Result<usize> {
        SYNC_WRITER_EVENTS.with_label_values(&["syncs"]).inc();
        let limit = self.config.batch_limit;
        let events = within_tx(self.db.as_ref(), &TxOptions::default(), self.retries, move |tx| {
            Box::pin(async move { tx.list_events(limit).await })
        })
        .await?;

        let mut synced = 0;
        for event in &events {
            if let Err(e) = self.sync_event(event).await {
                error!(event_id = event.id, path = %event.path, "failed to sync event: {}", e);
                SYNC_WRITER_EVENTS.with_label_values(&["sync_failed"]).inc();
                return Err(e);
            }
            synced += 1;
        }

        if synced == 0 {
            SYNC_WRITER_EVENTS.with_label_values(&["empty_syncs"]).inc();
        } else {
            debug!(synced, "events synced");
        }
        Ok(synced)
    }

    async fn sync_event(
        &self,
        event: &Event,
    ) -> Result<()> {
        let schema = self.schemas.schema_by_url_path(&event.path);
        let path = sync_path(schema.as_deref(), event);

        match event.event_type {
            EventType::Create | EventType::Update => {
                let key = config_key(schema.as_deref(), &path);
                let payload = sync_payload(event)?;
                debug!(key, "set on sync");
                let result = self.store.update(&key, &payload).await;
                record_op("update", &result);
                result?;
            }
            EventType::Delete => {
                if schema.as_ref().map(|s| s.state_versioning()).unwrap_or(false) {
                    for prefix in [STATE_PREFIX, MONITORING_PREFIX] {
                        let key = format!("{}{}", prefix, path);
                        debug!(key, "delete on sync");
                        if let Err(e) = self.store.delete(&key, false).await {
                            error!("delete of {} from sync failed: {}", key, e);
                        }
                    }
                }
                let key = config_key(schema.as_deref(), &path);
                debug!(key, "delete on sync");
                let result = self.store.delete(&key, false).await;
                record_op("delete", &result);
                result?;
            }
        }

        let id = event.id;
        within_tx(self.db.as_ref(), &TxOptions::default(), self.retries, move |tx| {
            Box::pin(async move { tx.delete_event(id).await })
        })
        .await
    }
}

fn record_op(
    op: &str,
    result: &Result<()>,
) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    SYNC_OPS.with_label_values(&[op, outcome]).inc();
}

/// Mirrored path of an event without the `/config` prefix: the rendered
/// sync key template when the schema has one, the resource path otherwise.
pub(crate) fn sync_path(
    schema: Option<&Schema>,
    event: &Event,
) -> String {
    let Some(schema) = schema.filter(|s| s.sync_key_template().is_some()) else {
        return event.path.clone();
    };
    let rendered = serde_json::from_str::<Map<String, Value>>(&event.body)
        .map_err(Error::from)
        .and_then(|data| schema.generate_custom_path(&data));
    match rendered {
        Ok(path) => path,
        Err(e) => {
            error!("failed to generate custom path of {}: {}", event.path, e);
            event.path.clone()
        }
    }
}

fn config_key(
    schema: Option<&Schema>,
    path: &str,
) -> String {
    match schema {
        Some(schema) if schema.skip_config_prefix() => path.to_string(),
        _ => format!("{}{}", CONFIG_PREFIX, path),
    }
}

/// Coordination store value of a create or update event.
///
/// `sync_property` projects one top-level property of the body. With
/// `sync_plain` the content is written as is, a JSON string being unwrapped
/// to its raw text; otherwise it is wrapped as `{"body": .., "version": ..}`.
pub(crate) fn sync_payload(event: &Event) -> Result<String> {
    let mut content = event.body.clone();

    if let Some(property) = &event.sync_property {
        let data: Map<String, Value> = serde_json::from_str(&event.body)?;
        let target = data
            .get(property)
            .ok_or_else(|| Error::Validation(format!("could not find property `{}`", property)))?;
        content = serde_json::to_string(target)?;
    }

    if event.sync_plain {
        if let Ok(Value::String(raw)) = serde_json::from_str::<Value>(&content) {
            content = raw;
        }
        return Ok(content);
    }

    let mut wrapped = Map::new();
    wrapped.insert("body".to_string(), Value::String(content));
    wrapped.insert("version".to_string(), Value::from(event.version));
    Ok(Value::Object(wrapped).to_string())
}
