//! Extension environments.
//!
//! Extension code runs in an opaque sandbox that receives a context map on
//! named events. The scripting runtimes themselves live outside of this
//! crate; only the dispatch interface is modelled here.

#[cfg(test)]
mod extension_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use crate::db::Transaction;
use crate::ExtensionError;
use crate::Result;

pub type Context = Map<String, Value>;

/// Context key an environment fills to report a handled failure.
pub const EXCEPTION_KEY: &str = "exception";
pub const EXCEPTION_MESSAGE_KEY: &str = "exception_message";

#[async_trait]
pub trait Environment: Send + Sync + 'static {
    /// Runs the handlers registered for `event`. In-transaction events get
    /// the open transaction.
    async fn handle_event(
        &self,
        event: &str,
        context: &mut Context,
        tx: Option<&mut dyn Transaction>,
    ) -> Result<()>;
}

/// Environments keyed by schema id and by watched event name.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    by_schema: HashMap<String, Arc<dyn Environment>>,
    /// Ordered: the first event whose `/<event>` prefixes a key wins
    by_event: Vec<(String, Arc<dyn Environment>)>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_schema(
        &mut self,
        schema_id: impl Into<String>,
        env: Arc<dyn Environment>,
    ) {
        self.by_schema.insert(schema_id.into(), env);
    }

    pub fn register_event(
        &mut self,
        event: impl Into<String>,
        env: Arc<dyn Environment>,
    ) {
        let event = event.into();
        self.by_event.retain(|(e, _)| *e != event);
        self.by_event.push((event, env));
    }

    /// Keeps the event environments named in `events`, in that order, and
    /// drops every other one. The order decides which event a key matches.
    pub fn restrict_events(
        &mut self,
        events: &[String],
    ) {
        let mut registered = std::mem::take(&mut self.by_event);
        for event in events {
            match registered.iter().position(|(e, _)| e == event) {
                Some(i) => self.by_event.push(registered.remove(i)),
                None => warn!(event, "watched event has no extension environment"),
            }
        }
        for (event, _) in registered {
            warn!(event, "extension event is not listed in watch.events, ignored");
        }
    }

    pub fn for_schema(
        &self,
        schema_id: &str,
    ) -> Option<Arc<dyn Environment>> {
        self.by_schema.get(schema_id).cloned()
    }

    /// Environment of the first registered event matching `key`.
    pub fn for_key(
        &self,
        key: &str,
    ) -> Option<(&str, Arc<dyn Environment>)> {
        self.by_event
            .iter()
            .find(|(event, _)| key.starts_with(&format!("/{}", event)))
            .map(|(event, env)| (event.as_str(), env.clone()))
    }
}

/// Invokes `event` on `env` under an optional time limit, turning an
/// exception left in the context into an error.
pub async fn handle_event(
    env: &dyn Environment,
    event: &str,
    context: &mut Context,
    tx: Option<&mut dyn Transaction>,
    limit: Option<Duration>,
) -> Result<()> {
    debug!(event, "running extension");
    let call = env.handle_event(event, context, tx);
    match limit {
        Some(limit) => timeout(limit, call).await.map_err(|_| ExtensionError::Timeout {
            event: event.to_string(),
            limit_ms: limit.as_millis() as u64,
        })??,
        None => call.await?,
    }

    match context.get(EXCEPTION_KEY) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(_)) => Err(ExtensionError::Failed {
            event: event.to_string(),
            message: context
                .get(EXCEPTION_MESSAGE_KEY)
                .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
                .unwrap_or_default(),
        }
        .into()),
        Some(_) => Err(ExtensionError::Failed {
            event: event.to_string(),
            message: "extension returned invalid error information".to_string(),
        }
        .into()),
    }
}
