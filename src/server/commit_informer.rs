use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::constants::SYNC_KEY_TX_COMMITTED;
use crate::metrics::COMMIT_INFORMER_EVENTS;
use crate::sync::CoordinationStore;
use crate::utils::async_task::sleep_or_cancelled;
use crate::Result;

const CHANNEL_CAPACITY: usize = 1024;
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Receives the id of the last event logged by a committed transaction.
#[cfg_attr(test, automock)]
pub trait CommitNotifier: Send + Sync + 'static {
    /// Never blocks; a dropped notification only delays the sync writer
    /// until its next poll.
    fn notify(
        &self,
        event_id: i64,
    );
}

/// Sending half, handed to every event-logging transaction.
#[derive(Clone)]
pub struct CommitInformer {
    sender: mpsc::Sender<i64>,
}

impl CommitInformer {
    pub fn new() -> (Self, mpsc::Receiver<i64>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }
}

impl CommitNotifier for CommitInformer {
    fn notify(
        &self,
        event_id: i64,
    ) {
        match self.sender.try_send(event_id) {
            Ok(()) => COMMIT_INFORMER_EVENTS.with_label_values(&["received"]).inc(),
            Err(TrySendError::Full(_)) => {
                debug!(event_id, "commit informer channel full, dropping notification");
                COMMIT_INFORMER_EVENTS.with_label_values(&["dropped"]).inc();
            }
            Err(TrySendError::Closed(_)) => {
                warn!(event_id, "commit informer is not running");
                COMMIT_INFORMER_EVENTS.with_label_values(&["dropped"]).inc();
            }
        }
    }
}

/// Publishes received event ids to `SYNC_KEY_TX_COMMITTED` so the sync
/// writer wakes up. Bursts are coalesced into a single write of the highest
/// id; failed writes are retried until a write succeeds or `cancel` fires.
pub struct CommitInformerWorker {
    receiver: mpsc::Receiver<i64>,
    store: Arc<dyn CoordinationStore>,
}

impl CommitInformerWorker {
    pub fn new(
        receiver: mpsc::Receiver<i64>,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self { receiver, store }
    }

    pub async fn run(
        mut self,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let event_id = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.receiver.recv() => match received {
                    Some(id) => id,
                    None => return Ok(()),
                },
            };

            let mut latest = self.coalesce(event_id);
            loop {
                match self.publish(latest).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("commit informer failed to publish event {}: {}", latest, e);
                        COMMIT_INFORMER_EVENTS.with_label_values(&["publish_failed"]).inc();
                        if !sleep_or_cancelled(RETRY_INTERVAL, &cancel).await {
                            return Ok(());
                        }
                        latest = self.coalesce(latest);
                    }
                }
            }
        }
    }

    /// Highest of `event_id` and every id already queued.
    fn coalesce(
        &mut self,
        event_id: i64,
    ) -> i64 {
        let mut latest = event_id;
        while let Ok(id) = self.receiver.try_recv() {
            latest = latest.max(id);
        }
        latest
    }

    async fn publish(
        &self,
        event_id: i64,
    ) -> Result<()> {
        let value = json!({ "event_id": event_id }).to_string();
        self.store.update(SYNC_KEY_TX_COMMITTED, &value).await?;
        debug!(event_id, "commit published");
        COMMIT_INFORMER_EVENTS.with_label_values(&["published"]).inc();
        Ok(())
    }
}
