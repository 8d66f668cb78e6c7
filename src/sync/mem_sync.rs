use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CasCondition;
use super::CoordinationStore;
use super::MemStore;
use super::Node;
use super::WatchResponse;
use crate::Result;
use crate::SyncError;

const WATCH_CHANNEL_CAPACITY: usize = 32;

struct HeldLock {
    lease: i64,
    lost: CancellationToken,
    stop: CancellationToken,
}

/// Client of a `MemStore` acting on behalf of one cluster member.
pub struct MemSync {
    store: Arc<MemStore>,
    process_id: String,
    master_ttl: Duration,
    locks: Arc<DashMap<String, HeldLock>>,
}

impl MemSync {
    pub fn new(
        store: Arc<MemStore>,
        process_id: impl Into<String>,
        master_ttl: Duration,
    ) -> Self {
        Self {
            store,
            process_id: process_id.into(),
            master_ttl,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    fn try_lock(
        &self,
        key: &str,
    ) -> Option<CancellationToken> {
        let lease = self.store.grant_lease(self.master_ttl);
        if !self.store.put_if_absent(key, &self.process_id, Some(lease)) {
            self.store.revoke(lease);
            return None;
        }

        let held = HeldLock {
            lease,
            lost: CancellationToken::new(),
            stop: CancellationToken::new(),
        };
        let lost = held.lost.clone();
        self.spawn_keep_alive(key.to_string(), &held);
        self.locks.insert(key.to_string(), held);
        info!(key, process_id = %self.process_id, "lock acquired");
        Some(lost)
    }

    /// Refreshes the lease every third of the TTL; cancels `lost` once the
    /// lease is gone.
    fn spawn_keep_alive(
        &self,
        key: String,
        held: &HeldLock,
    ) {
        let store = self.store.clone();
        let locks = self.locks.clone();
        let lease = held.lease;
        let lost = held.lost.clone();
        let stop = held.stop.clone();
        let period = (self.master_ttl / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        if !store.keep_alive(lease) {
                            warn!(key, lease, "lock lease lost");
                            locks.remove_if(&key, |_, held| held.lease == lease);
                            lost.cancel();
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for MemSync {
    fn process_id(&self) -> String {
        self.process_id.clone()
    }

    async fn has_lock(
        &self,
        key: &str,
    ) -> bool {
        self.locks
            .get(key)
            .map(|held| !held.lost.is_cancelled())
            .unwrap_or(false)
    }

    async fn lock(
        &self,
        key: &str,
        block: bool,
    ) -> Result<CancellationToken> {
        if let Some(held) = self.locks.get(key) {
            if !held.lost.is_cancelled() {
                return Ok(held.lost.clone());
            }
        }

        let mut changes = self.store.subscribe();
        loop {
            if let Some(lost) = self.try_lock(key) {
                return Ok(lost);
            }
            if !block {
                return Err(SyncError::LockFailed { path: key.to_string() }.into());
            }
            debug!(key, "lock is taken, waiting for a change");
            changes
                .changed()
                .await
                .map_err(|_| SyncError::Unavailable("store closed".to_string()))?;
        }
    }

    async fn unlock(
        &self,
        key: &str,
    ) -> Result<()> {
        if let Some((_, held)) = self.locks.remove(key) {
            held.stop.cancel();
            self.store.revoke(held.lease);
            info!(key, process_id = %self.process_id, "lock released");
        }
        Ok(())
    }

    async fn fetch(
        &self,
        key: &str,
    ) -> Result<Option<Node>> {
        Ok(self.store.get(key))
    }

    async fn update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.store.put(key, value, None);
        Ok(())
    }

    async fn update_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<()> {
        let lease = self.store.grant_lease(Duration::from_secs(ttl_secs));
        self.store.put(key, value, Some(lease));
        Ok(())
    }

    async fn delete(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<()> {
        self.store.delete(key, prefix);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        conditions: &[CasCondition],
    ) -> Result<bool> {
        Ok(self.store.compare_and_swap(key, value, conditions))
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchResponse>> {
        let mut source = self.store.watch(key, from_revision)?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(key, "watch cancelled");
                        return;
                    }
                    event = source.recv() => {
                        let response = match event {
                            Some(event) => Ok(event),
                            None => Err(SyncError::WatchClosed(key.clone())),
                        };
                        let terminal = response.is_err();
                        if tx.send(response).await.is_err() || terminal {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

impl Drop for MemSync {
    fn drop(&mut self) {
        for held in self.locks.iter() {
            held.stop.cancel();
        }
    }
}
