use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::db::Transaction;
use crate::extension::Context;
use crate::extension::Environment;
use crate::extension::EXCEPTION_KEY;
use crate::extension::EXCEPTION_MESSAGE_KEY;
use crate::ExtensionError;
use crate::Result;

/// Environment remembering every invocation.
#[derive(Default)]
pub(crate) struct RecordingEnvironment {
    calls: Mutex<Vec<(String, Context)>>,
    delay: Option<Duration>,
    fail: bool,
    raise: Option<String>,
}

impl RecordingEnvironment {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` first.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Every call returns an error.
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Every call leaves an exception in the context.
    pub(crate) fn raising(message: &str) -> Self {
        Self {
            raise: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, Context)> {
        self.calls.lock().clone()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl Environment for RecordingEnvironment {
    async fn handle_event(
        &self,
        event: &str,
        context: &mut Context,
        tx: Option<&mut dyn Transaction>,
    ) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut recorded = context.clone();
        recorded.insert("has_transaction".to_string(), Value::Bool(tx.is_some()));
        self.calls.lock().push((event.to_string(), recorded));

        if self.fail {
            return Err(ExtensionError::Failed {
                event: event.to_string(),
                message: "recording environment failure".to_string(),
            }
            .into());
        }
        if let Some(message) = &self.raise {
            context.insert(EXCEPTION_KEY.to_string(), serde_json::json!({"code": 400}));
            context.insert(EXCEPTION_MESSAGE_KEY.to_string(), Value::String(message.clone()));
        }
        Ok(())
    }
}
