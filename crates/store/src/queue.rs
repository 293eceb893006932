use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kwatch_core::{Delta, DeltaKind, Object, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use tokio::sync::Notify;
use tracing::debug;

use crate::index::KnownObjects;

/// All deltas pending for one key, oldest first.
#[derive(Debug)]
pub struct Batch {
    pub key: ObjectKey,
    pub deltas: SmallVec<[Delta; 4]>,
}

impl Batch {
    /// The delta that decides the batch's effective state.
    pub fn terminal(&self) -> Option<&Delta> { self.deltas.last() }
}

/// Outcome of a resync diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    pub listed: usize,
    pub unchanged: usize,
    pub upserted: usize,
    pub deleted: usize,
}

#[derive(Default)]
struct QueueState {
    pending: FxHashMap<ObjectKey, SmallVec<[Delta; 4]>>,
    /// Keys with pending deltas that may be handed out, first-pending first.
    ready: VecDeque<ObjectKey>,
    /// Popped keys not yet marked done, with the terminal state of their batch.
    in_flight: FxHashMap<ObjectKey, Option<Arc<Object>>>,
    closed: bool,
}

impl QueueState {
    /// Append to the key's pending list; returns true when the key became ready.
    fn enqueue(&mut self, delta: Delta) -> bool {
        match self.pending.entry(delta.key().clone()) {
            Entry::Occupied(mut e) => {
                e.get_mut().push(delta);
                false
            }
            Entry::Vacant(e) => {
                let key = e.key().clone();
                e.insert(smallvec![delta]);
                if self.in_flight.contains_key(&key) {
                    false
                } else {
                    self.ready.push_back(key);
                    true
                }
            }
        }
    }

    fn take_ready(&mut self) -> Option<Batch> {
        while let Some(key) = self.ready.pop_front() {
            if let Some(deltas) = self.pending.remove(&key) {
                let terminal = deltas.last().and_then(|d| match d.kind {
                    DeltaKind::Deleted => None,
                    _ => Some(Arc::clone(&d.object)),
                });
                self.in_flight.insert(key.clone(), terminal);
                return Some(Batch { key, deltas });
            }
        }
        None
    }

    /// Best-known state of `key`: pending deltas first, then the in-flight batch, then the store.
    fn known(&self, key: &ObjectKey, store: &dyn KnownObjects) -> Option<Arc<Object>> {
        if let Some(last) = self.pending.get(key).and_then(|d| d.last()) {
            return match last.kind {
                DeltaKind::Deleted => None,
                _ => Some(Arc::clone(&last.object)),
            };
        }
        if let Some(terminal) = self.in_flight.get(key) {
            return terminal.clone();
        }
        store.get(key)
    }
}

/// Per-key coalescing FIFO between a reflector and its dispatch loop.
///
/// Ordering is preserved within a key; across keys the first key to become pending is served
/// first. A popped key stays in flight until [`DeltaQueue::done`], so no two consumers ever
/// hold the same key.
#[derive(Clone, Default)]
pub struct DeltaQueue {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DeltaQueue {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, delta: Delta) {
        let became_ready = {
            let mut st = self.lock();
            if st.closed {
                debug!(key = %delta.key(), "queue closed; dropping delta");
                return;
            }
            st.enqueue(delta)
        };
        if became_ready {
            self.inner.notify.notify_one();
        }
    }

    /// Wait for a ready key and take all of its pending deltas. Returns `None` once the
    /// queue is closed and nothing is ready.
    pub async fn pop(&self) -> Option<Batch> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(batch) = st.take_ready() {
                    return Some(batch);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`DeltaQueue::pop`].
    pub fn try_pop(&self) -> Option<Batch> { self.lock().take_ready() }

    /// Release a popped key. Deltas pushed while it was in flight become ready now.
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut st = self.lock();
            st.in_flight.remove(key);
            if st.pending.contains_key(key) {
                st.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Reconcile a full listing against everything known (store, in-flight and pending).
    ///
    /// Listed objects whose version differs from the known one are queued as `Added`; known
    /// keys missing from the listing are queued as `Deleted` carrying the last-known object.
    /// Runs under the queue lock so it serializes with concurrent pushes.
    pub fn replace(&self, snapshot: Vec<Object>, store: &dyn KnownObjects) -> ReplaceReport {
        self.reconcile(snapshot, store, true)
    }

    /// Like [`DeltaQueue::replace`] but never synthesizes deletions, for listings known to
    /// be incomplete.
    pub fn merge(&self, snapshot: Vec<Object>, store: &dyn KnownObjects) -> ReplaceReport {
        self.reconcile(snapshot, store, false)
    }

    fn reconcile(&self, snapshot: Vec<Object>, store: &dyn KnownObjects, prune: bool) -> ReplaceReport {
        let mut report = ReplaceReport { listed: snapshot.len(), ..Default::default() };
        let mut woke = 0usize;
        {
            let mut st = self.lock();
            if st.closed {
                return report;
            }
            let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
            for obj in snapshot {
                if !listed.insert(obj.key.clone()) {
                    debug!(key = %obj.key, "duplicate key in listing; keeping first");
                    continue;
                }
                match st.known(&obj.key, store) {
                    Some(prev) if prev.resource_version == obj.resource_version => report.unchanged += 1,
                    _ => {
                        report.upserted += 1;
                        if st.enqueue(Delta::added(obj)) {
                            woke += 1;
                        }
                    }
                }
            }

            if prune {
                let mut candidates: FxHashSet<ObjectKey> = store.list_keys().into_iter().collect();
                candidates.extend(st.pending.keys().cloned());
                candidates.extend(st.in_flight.keys().cloned());
                let mut gone: Vec<ObjectKey> = candidates.into_iter().filter(|k| !listed.contains(k)).collect();
                gone.sort_unstable();
                for key in gone {
                    if let Some(last) = st.known(&key, store) {
                        report.deleted += 1;
                        if st.enqueue(Delta::deleted(last)) {
                            woke += 1;
                        }
                    }
                }
            }
        }
        for _ in 0..woke {
            self.inner.notify.notify_one();
        }
        report
    }

    /// Stop accepting deltas and wake all waiting consumers. Already-pending keys can
    /// still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize { self.lock().pending.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.lock().in_flight.len() }
}
