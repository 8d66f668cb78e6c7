use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::Map;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::ScopedRetryConfig;
use crate::constants::lock_key;
use crate::constants::MONITORING_PREFIX;
use crate::constants::MONITORING_UPDATE_EVENT;
use crate::constants::POST_MONITORING_UPDATE_IN_TX;
use crate::constants::POST_STATE_UPDATE_IN_TX;
use crate::constants::PRE_MONITORING_UPDATE_IN_TX;
use crate::constants::PRE_STATE_UPDATE_IN_TX;
use crate::constants::REVISION_CURRENT;
use crate::constants::STATE_PREFIX;
use crate::constants::STATE_UPDATE_EVENT;
use crate::constants::STATE_WATCH_LOCK_SUBSYSTEM;
use crate::db::id_filter;
use crate::db::within_tx;
use crate::db::Database;
use crate::db::Transaction;
use crate::db::TxOptions;
use crate::extension::handle_event;
use crate::extension::Context;
use crate::extension::Environment;
use crate::extension::ExtensionRegistry;
use crate::metrics::STATE_UPDATE_DURATION_MS;
use crate::schema::Schema;
use crate::schema::SchemaManager;
use crate::sync::CoordinationStore;
use crate::sync::EventAction;
use crate::sync::SyncEvent;
use crate::sync::WatchResponse;
use crate::utils::async_task::sleep_or_cancelled;
use crate::Error;
use crate::Result;
use crate::SyncError;

/// Agent report kinds, routed by key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// `/state/<path>`: `{version, state?, error?}`
    State,
    /// `/monitoring/<path>`: `{version, monitoring}`
    Monitoring,
}

impl Report {
    /// Classifies `key`, returning the report kind and the schema path.
    pub fn route(key: &str) -> Option<(Report, &str)> {
        [(Report::State, STATE_PREFIX), (Report::Monitoring, MONITORING_PREFIX)]
            .into_iter()
            .find_map(|(report, prefix)| {
                key.strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('/'))
                    .map(|rest| (report, rest))
            })
    }

    fn event_name(&self) -> &'static str {
        match self {
            Report::State => STATE_UPDATE_EVENT,
            Report::Monitoring => MONITORING_UPDATE_EVENT,
        }
    }
}

/// Translates agent reports under `/state` and `/monitoring` into
/// `ResourceState` updates. One member at a time holds the state watch lock.
pub struct StateWatcher {
    store: Arc<dyn CoordinationStore>,
    db: Arc<dyn Database>,
    schemas: Arc<SchemaManager>,
    extensions: Arc<ExtensionRegistry>,
    backoff: Duration,
    retries: ScopedRetryConfig,
}

impl StateWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        db: Arc<dyn Database>,
        schemas: Arc<SchemaManager>,
        extensions: Arc<ExtensionRegistry>,
        backoff: Duration,
        retries: ScopedRetryConfig,
    ) -> Self {
        Self {
            store,
            db,
            schemas,
            extensions,
            backoff,
            retries,
        }
    }

    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.iterate(&cancel).await {
                warn!("state watch error: {}", e);
            }
            if !sleep_or_cancelled(self.backoff, &cancel).await {
                return Ok(());
            }
        }
    }

    async fn iterate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = lock_key(STATE_WATCH_LOCK_SUBSYSTEM, "");
        let lost = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            lost = self.store.lock(&key, true) => lost?,
        };
        info!("state watcher became active");

        let result = self.watch(cancel, &lost, &key).await;

        if let Err(e) = self.store.unlock(&key).await {
            warn!("unlocking state watch failed: {}", e);
        }
        result
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        lost: &CancellationToken,
        lock: &str,
    ) -> Result<()> {
        let watch_cancel = cancel.child_token();
        let _guard = watch_cancel.clone().drop_guard();
        let mut states = self
            .store
            .watch(STATE_PREFIX, REVISION_CURRENT, watch_cancel.clone())
            .await?;
        let mut monitorings = self
            .store
            .watch(MONITORING_PREFIX, REVISION_CURRENT, watch_cancel)
            .await?;

        loop {
            let (prefix, response): (&str, Option<WatchResponse>) = tokio::select! {
                biased;
                _ = lost.cancelled() => {
                    return Err(SyncError::LockLost { path: lock.to_string() }.into());
                }
                _ = cancel.cancelled() => return Ok(()),
                r = states.recv() => (STATE_PREFIX, r),
                r = monitorings.recv() => (MONITORING_PREFIX, r),
            };

            let event = match response {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SyncError::WatchClosed(prefix.to_string()).into()),
            };
            if let Err(e) = self.process_event(&event).await {
                warn!("error during state update of {}: {}", event.key, e);
            }
        }
    }

    /// Routes one agent report. Returns whether a `ResourceState` changed.
    #[instrument(skip_all, fields(key = %event.key, revision = event.revision))]
    pub async fn process_event(
        &self,
        event: &SyncEvent,
    ) -> Result<bool> {
        if event.action == EventAction::Delete {
            debug!(key = %event.key, "report removed");
            return Ok(false);
        }
        let Some((report, schema_path)) = Report::route(&event.key) else {
            debug!(key = %event.key, "not a state report");
            return Ok(false);
        };
        let schema = match self.schemas.schema_by_sync_path(schema_path) {
            Some(schema) if schema.state_versioning() => schema,
            _ => {
                debug!("{} on unexpected path '{}'", report.event_name(), schema_path);
                return Ok(false);
            }
        };
        let resource_id = schema.resource_id_from_path(schema_path);
        info!(
            "started {} for {} {} {:?}",
            report.event_name(),
            event.action,
            event.key,
            event.data
        );

        let started = Instant::now();
        let result = self
            .apply_report(report, schema.clone(), resource_id, event.data.clone())
            .await;
        STATE_UPDATE_DURATION_MS
            .with_label_values(&[&schema.id, report.event_name()])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn apply_report(
        &self,
        report: Report,
        schema: Arc<Schema>,
        resource_id: String,
        data: Map<String, Value>,
    ) -> Result<bool> {
        let options = TxOptions::with_isolation_level(schema.isolation_level(report.event_name()));
        let env = self.extensions.for_schema(&schema.id);

        within_tx(self.db.as_ref(), &options, self.retries, |tx| {
            let schema = schema.clone();
            let resource_id = resource_id.clone();
            let data = data.clone();
            let env = env.clone();
            Box::pin(async move {
                match report {
                    Report::State => state_update(tx, &schema, &resource_id, &data, env.as_deref()).await,
                    Report::Monitoring => {
                        monitoring_update(tx, &schema, &resource_id, &data, env.as_deref()).await
                    }
                }
            })
        })
        .await
    }
}

/// Agents may encode the version as a float; only integral values count.
fn report_version(
    data: &Map<String, Value>,
    kind: &str,
) -> Result<i64> {
    let Some(version) = data.get("version") else {
        return Err(Error::Validation(format!("no version in {} information", kind)));
    };
    version
        .as_i64()
        .or_else(|| {
            version
                .as_f64()
                .filter(|v| v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64)
                .map(|v| v as i64)
        })
        .ok_or_else(|| Error::Validation(format!("invalid version {} in {} information", version, kind)))
}

async fn run_hook(
    env: Option<&dyn Environment>,
    event: &str,
    schema: &Schema,
    context: &mut Context,
    tx: &mut dyn Transaction,
) -> Result<()> {
    let Some(env) = env else {
        return Ok(());
    };
    handle_event(env, event, context, Some(tx), schema.time_limit(event)).await
}

async fn state_update(
    tx: &mut dyn Transaction,
    schema: &Schema,
    resource_id: &str,
    data: &Map<String, Value>,
    env: Option<&dyn Environment>,
) -> Result<bool> {
    let filter = id_filter(resource_id);
    let resource = tx.fetch(schema, &filter).await?;
    let mut state = tx.state_fetch(schema, &filter).await?;

    if state.state_version == state.config_version {
        return Ok(false);
    }
    let version = report_version(data, "state")?;
    if version < state.state_version {
        debug!(resource_id, version, current = state.state_version, "backwards state update ignored");
        return Ok(false);
    }
    if version > state.config_version {
        debug!(resource_id, version, config = state.config_version, "state ahead of config ignored");
        return Ok(false);
    }

    state.state_version = version;
    if let Some(Value::String(error)) = data.get("error") {
        state.error = error.clone();
    }
    if let Some(Value::String(s)) = data.get("state") {
        state.state = s.clone();
    }

    let mut context = Context::new();
    context.insert("resource".to_string(), Value::Object(resource.data().clone()));
    context.insert("schema".to_string(), Value::from(schema.id.clone()));
    context.insert("state".to_string(), Value::Object(data.clone()));
    context.insert("config_version".to_string(), Value::from(state.config_version));

    run_hook(env, PRE_STATE_UPDATE_IN_TX, schema, &mut context, tx).await?;
    tx.state_update(&resource, &state).await?;
    run_hook(env, POST_STATE_UPDATE_IN_TX, schema, &mut context, tx).await?;
    Ok(true)
}

async fn monitoring_update(
    tx: &mut dyn Transaction,
    schema: &Schema,
    resource_id: &str,
    data: &Map<String, Value>,
    env: Option<&dyn Environment>,
) -> Result<bool> {
    let filter = id_filter(resource_id);
    let resource = tx.fetch(schema, &filter).await?;
    let mut state = tx.state_fetch(schema, &filter).await?;

    if !state.is_reconciled() {
        debug!(
            "skipping monitoring update, because config version ({}) != state version ({})",
            state.config_version, state.state_version
        );
        return Ok(false);
    }
    let version = report_version(data, "monitoring")?;
    if version != state.config_version {
        debug!(
            "dropping monitoring update, because config version ({}) != input monitoring version ({})",
            state.config_version, version
        );
        return Ok(false);
    }
    state.monitoring = match data.get("monitoring") {
        Some(Value::String(monitoring)) => monitoring.clone(),
        _ => return Err(Error::Validation("no monitoring in monitoring information".to_string())),
    };

    let mut context = Context::new();
    context.insert("resource".to_string(), Value::Object(resource.data().clone()));
    context.insert("schema".to_string(), Value::from(schema.id.clone()));
    context.insert("monitoring".to_string(), Value::from(state.monitoring.clone()));

    run_hook(env, PRE_MONITORING_UPDATE_IN_TX, schema, &mut context, tx).await?;
    tx.state_update(&resource, &state).await?;
    run_hook(env, POST_MONITORING_UPDATE_IN_TX, schema, &mut context, tx).await?;
    Ok(true)
}
