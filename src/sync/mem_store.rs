use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use super::CasCondition;
use super::EventAction;
use super::Node;
use super::SyncEvent;
use crate::constants::MEM_STORE_HISTORY_REVISIONS;
use crate::constants::REVISION_CURRENT;
use crate::SyncError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    mod_revision: i64,
    lease: Option<i64>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<SyncEvent>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    compact_revision: i64,
    data: BTreeMap<String, Entry>,
    history: VecDeque<SyncEvent>,
    /// Revisions kept in `history`; older ones are compacted on commit.
    history_revisions: i64,
    leases: HashMap<i64, Lease>,
    next_lease: i64,
    watchers: Vec<Watcher>,
}

/// In-memory watchable key-value store shared by every `MemSync` client of
/// a simulated cluster.
pub struct MemStore {
    inner: Mutex<Inner>,
    revision_tx: watch::Sender<i64>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Self::with_history_limit(MEM_STORE_HISTORY_REVISIONS)
    }

    /// Store that keeps only the last `revisions` revisions of history.
    pub fn with_history_limit(revisions: i64) -> Arc<Self> {
        let (revision_tx, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                history_revisions: revisions.max(1),
                ..Inner::default()
            }),
            revision_tx,
        })
    }

    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    pub fn compact_revision(&self) -> i64 {
        self.inner.lock().compact_revision
    }

    /// Number of events still replayable by revision watches.
    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Receives the store revision after every commit.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.revision_tx.subscribe()
    }

    /// Value of `key`, if present.
    pub fn value(
        &self,
        key: &str,
    ) -> Option<String> {
        self.inner.lock().data.get(key).map(|e| e.value.clone())
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<Node> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.data.get(key) {
            return Some(Node {
                key: key.to_string(),
                value: entry.value.clone(),
                revision: entry.mod_revision,
                children: vec![],
            });
        }

        let prefix = format!("{}/", key.trim_end_matches('/'));
        let children: Vec<Node> = inner
            .data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, e)| Node {
                key: k.clone(),
                value: e.value.clone(),
                revision: e.mod_revision,
                children: vec![],
            })
            .collect();
        if children.is_empty() {
            return None;
        }
        Some(Node {
            key: key.to_string(),
            children,
            ..Default::default()
        })
    }

    pub fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> i64 {
        let mut inner = self.inner.lock();
        let revision = inner.next_revision();
        inner.put_entry(key, value, lease, revision);
        self.commit(inner, revision)
    }

    /// Puts `key` only when it does not exist. Used for lock acquisition.
    pub fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.data.contains_key(key) {
            return false;
        }
        let revision = inner.next_revision();
        inner.put_entry(key, value, lease, revision);
        self.commit(inner, revision);
        true
    }

    /// Deletes `key`, or every key under it when `prefix` is set. All
    /// deletions share one revision. Returns the number of removed keys.
    pub fn delete(
        &self,
        key: &str,
        prefix: bool,
    ) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = if prefix {
            inner
                .data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if inner.data.contains_key(key) {
            vec![key.to_string()]
        } else {
            vec![]
        };
        if keys.is_empty() {
            return 0;
        }

        let revision = inner.next_revision();
        for k in &keys {
            inner.remove_entry(k, revision);
        }
        self.commit(inner, revision);
        keys.len()
    }

    pub fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        conditions: &[CasCondition],
    ) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.data.get(key);
        let holds = conditions.iter().all(|condition| match condition {
            CasCondition::ValueEquals(expected) => current.map(|e| &e.value == expected).unwrap_or(false),
            CasCondition::RevisionEquals(rev) => current.map(|e| e.mod_revision).unwrap_or(0) == *rev,
        });
        if !holds {
            trace!(key, "compare-and-swap precondition failed");
            return false;
        }
        let lease = current.and_then(|e| e.lease);
        let revision = inner.next_revision();
        inner.put_entry(key, value, lease, revision);
        self.commit(inner, revision);
        true
    }

    /// Grants a lease expiring after `ttl` unless kept alive.
    pub fn grant_lease(
        self: &Arc<Self>,
        ttl: Duration,
    ) -> i64 {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_lease += 1;
            let id = inner.next_lease;
            inner.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            id
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(deadline) = weak.upgrade().and_then(|store| store.lease_deadline(id)) else {
                    return;
                };
                sleep_until(deadline).await;
                match weak.upgrade() {
                    Some(store) if store.expire_if_due(id) => return,
                    Some(_) => continue,
                    None => return,
                }
            }
        });
        id
    }

    /// Refreshes a lease. Returns false when it no longer exists.
    pub fn keep_alive(
        &self,
        lease: i64,
    ) -> bool {
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                true
            }
            None => false,
        }
    }

    /// Drops a lease and deletes every key attached to it.
    pub fn revoke(
        &self,
        lease: i64,
    ) {
        let mut inner = self.inner.lock();
        let Some(l) = inner.leases.remove(&lease) else {
            return;
        };
        if l.keys.is_empty() {
            return;
        }
        debug!(lease, keys = l.keys.len(), "lease revoked");
        let revision = inner.next_revision();
        for key in &l.keys {
            inner.remove_entry(key, revision);
        }
        self.commit(inner, revision);
    }

    /// Revokes the lease attached to `key`, as if its owner stopped refreshing it.
    pub fn revoke_key_lease(
        &self,
        key: &str,
    ) {
        let lease = self.inner.lock().data.get(key).and_then(|e| e.lease);
        if let Some(lease) = lease {
            self.revoke(lease);
        }
    }

    /// Drops history below `revision`; watches starting earlier fail.
    pub fn compact(
        &self,
        revision: i64,
    ) {
        if self.inner.lock().compact_to(revision) {
            debug!(revision, "history compacted");
        }
    }

    /// Registers a prefix watcher.
    ///
    /// # Errors
    /// `SyncError::Compacted` when `from_revision` is below the compaction frontier.
    pub fn watch(
        &self,
        prefix: &str,
        from_revision: i64,
    ) -> Result<mpsc::UnboundedReceiver<SyncEvent>, SyncError> {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();

        if from_revision == REVISION_CURRENT {
            let mut current: Vec<SyncEvent> = inner
                .data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| SyncEvent::new(EventAction::Get, k.clone(), e.value.clone(), e.mod_revision))
                .collect();
            current.sort_by_key(|e| e.revision);
            for event in current {
                let _ = tx.send(event);
            }
        } else {
            if from_revision < inner.compact_revision {
                return Err(SyncError::Compacted {
                    compact_revision: inner.compact_revision,
                });
            }
            for event in inner
                .history
                .iter()
                .filter(|e| e.revision >= from_revision && e.key.starts_with(prefix))
            {
                let _ = tx.send(event.clone());
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    fn lease_deadline(
        &self,
        lease: i64,
    ) -> Option<Instant> {
        self.inner.lock().leases.get(&lease).map(|l| l.deadline)
    }

    fn expire_if_due(
        &self,
        lease: i64,
    ) -> bool {
        let due = match self.lease_deadline(lease) {
            Some(deadline) => deadline <= Instant::now(),
            None => return true,
        };
        if due {
            debug!(lease, "lease expired");
            self.revoke(lease);
        }
        due
    }

    /// Publishes the events of `revision` to watchers and waiters.
    fn commit(
        &self,
        mut inner: parking_lot::MutexGuard<'_, Inner>,
        revision: i64,
    ) -> i64 {
        let start = inner
            .history
            .iter()
            .rposition(|e| e.revision != revision)
            .map(|i| i + 1)
            .unwrap_or(0);
        let events: Vec<SyncEvent> = inner.history.range(start..).cloned().collect();
        inner.watchers.retain(|w| {
            events
                .iter()
                .filter(|e| e.key.starts_with(&w.prefix))
                .all(|e| w.tx.send(e.clone()).is_ok())
        });
        let floor = revision - inner.history_revisions + 1;
        inner.compact_to(floor);
        drop(inner);
        self.revision_tx.send_replace(revision);
        revision
    }
}

impl Inner {
    fn next_revision(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }

    fn compact_to(
        &mut self,
        revision: i64,
    ) -> bool {
        if revision <= self.compact_revision {
            return false;
        }
        self.compact_revision = revision;
        while self.history.front().is_some_and(|e| e.revision < revision) {
            self.history.pop_front();
        }
        trace!(revision, "history window advanced");
        true
    }

    fn put_entry(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<i64>,
        revision: i64,
    ) {
        if let Some(old) = self.data.get(key).and_then(|e| e.lease) {
            if Some(old) != lease {
                if let Some(l) = self.leases.get_mut(&old) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                mod_revision: revision,
                lease,
            },
        );
        self.history
            .push_back(SyncEvent::new(EventAction::Set, key, value, revision));
    }

    fn remove_entry(
        &mut self,
        key: &str,
        revision: i64,
    ) {
        if let Some(entry) = self.data.remove(key) {
            if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
                l.keys.remove(key);
            }
            self.history
                .push_back(SyncEvent::new(EventAction::Delete, key, "", revision));
        }
    }
}
