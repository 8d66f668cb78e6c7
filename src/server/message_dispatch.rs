use std::collections::HashMap;
use std::future::Future;

use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::trace;

use crate::Error;
use crate::Result;

#[derive(Default)]
struct Groups {
    /// normalized key -> signal shared by every waiter of that key
    waiters: HashMap<String, watch::Sender<()>>,
    closed: bool,
}

impl Groups {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::DispatchClosed);
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        key: String,
    ) -> watch::Receiver<()> {
        self.waiters
            .entry(key)
            .or_insert_with(|| watch::channel(()).0)
            .subscribe()
    }
}

/// In-process wake-ups for long-poll readers.
///
/// A reader waiting on `/a/b/c` is woken by a broadcast of `/a/b/c`, `/a/b`
/// or `/a`. A broadcast never wakes readers of an ancestor key.
#[derive(Default)]
pub struct MessageDispatch {
    groups: Mutex<Groups>,
}

impl MessageDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a broadcast covers `key` or the dispatch is closed.
    pub async fn wait(
        &self,
        key: &str,
    ) -> Result<()> {
        let mut signal = {
            let mut groups = self.groups.lock().await;
            groups.ensure_open()?;
            groups.subscribe(normalize_key(key))
        };
        // A dropped sender is a wake-up too
        let _ = signal.changed().await;
        Ok(())
    }

    /// Fetches the current value of `key`. Returns it at once when its hash
    /// differs from `old_hash`, otherwise waits for a broadcast covering
    /// `key` and returns the re-fetched value with its new hash.
    ///
    /// The first fetch and the subscription happen under the dispatch lock,
    /// so a broadcast cannot slip in between.
    pub async fn get_or_wait<R, F, Fut, H>(
        &self,
        key: &str,
        old_hash: &str,
        mut fetch: F,
        hash: H,
    ) -> Result<(R, String)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
        H: Fn(&R) -> String,
    {
        let mut signal = {
            let mut groups = self.groups.lock().await;
            groups.ensure_open()?;

            let current = fetch().await?;
            let current_hash = hash(&current);
            if current_hash != old_hash {
                trace!(key, "hash changed, not waiting");
                return Ok((current, current_hash));
            }
            groups.subscribe(normalize_key(key))
        };

        let _ = signal.changed().await;

        let fresh = fetch().await?;
        let fresh_hash = hash(&fresh);
        Ok((fresh, fresh_hash))
    }

    /// Wakes every reader of `key` and of the keys below it.
    ///
    /// # Errors
    /// `Error::DispatchClosed` once `close` was called.
    pub async fn broadcast(
        &self,
        key: &str,
    ) -> Result<()> {
        let key = normalize_key(key);
        let mut groups = self.groups.lock().await;
        groups.ensure_open()?;

        let woken: Vec<String> = groups
            .waiters
            .keys()
            .filter(|waiting| covers(&key, waiting))
            .cloned()
            .collect();
        for waiting in woken {
            if let Some(signal) = groups.waiters.remove(&waiting) {
                signal.send_replace(());
            }
        }
        debug!(key, "broadcast");
        Ok(())
    }

    /// Wakes all readers and rejects further waits and broadcasts.
    pub async fn close(&self) {
        let mut groups = self.groups.lock().await;
        groups.closed = true;
        for (_, signal) in groups.waiters.drain() {
            signal.send_replace(());
        }
    }
}

/// Collapses repeated slashes and drops a trailing slash.
pub fn normalize_key(key: &str) -> String {
    let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// `broadcast` covers `waiting` when it equals it or is a segment-aligned prefix.
fn covers(
    broadcast: &str,
    waiting: &str,
) -> bool {
    if broadcast == "/" {
        return true;
    }
    waiting == broadcast
        || waiting
            .strip_prefix(broadcast)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}
