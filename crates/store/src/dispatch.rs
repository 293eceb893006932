use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use kwatch_core::{classify, DeltaKind, Handler, ObjectKey, ResourceKind, Transition};
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::index::{IndexedStore, StoreReader};
use crate::queue::{Batch, DeltaQueue};

/// Drains a [`DeltaQueue`], classifies each batch against the store, notifies the handler
/// and then applies the batch's terminal state.
pub struct Dispatcher {
    kind: ResourceKind,
    queue: DeltaQueue,
    store: IndexedStore,
    handler: Arc<dyn Handler>,
}

impl Dispatcher {
    pub fn new(kind: ResourceKind, queue: DeltaQueue, store: IndexedStore, handler: Arc<dyn Handler>) -> Self {
        Self { kind, queue, store, handler }
    }

    pub fn reader(&self) -> StoreReader { self.store.reader() }

    /// Run until the queue is closed or `shutdown` fires. Cancellation is only observed
    /// between batches.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(kind = %self.kind, "dispatch loop started");
        let mut batches = 0u64;
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.queue.pop() => match next {
                    Some(b) => b,
                    None => {
                        debug!(kind = %self.kind, "queue closed and drained");
                        break;
                    }
                },
            };
            let key = batch.key.clone();
            self.process(batch).await;
            self.queue.done(&key);
            batches += 1;
        }
        info!(kind = %self.kind, batches, "dispatch loop stopped");
    }

    /// Handle one drained batch. Returns the transition delivered to the handler, if any.
    pub async fn process(&mut self, batch: Batch) -> Option<Transition> {
        let terminal = batch.terminal()?.clone();
        if batch.deltas.len() > 1 {
            debug!(kind = %self.kind, key = %batch.key, coalesced = batch.deltas.len(), "folded deltas");
        }
        let prior = self.store.get(&batch.key);
        let transition = classify(prior.as_ref(), &terminal);
        match &transition {
            Some(t) => self.deliver(&batch.key, t).await,
            None => debug!(kind = %self.kind, key = %batch.key, "no effective transition"),
        }
        let post = match terminal.kind {
            DeltaKind::Deleted => None,
            DeltaKind::Added | DeltaKind::Modified => Some(terminal.object),
        };
        self.store.apply(&batch.key, post);
        gauge!("kwatch_store_objects", self.store.len() as f64, "kind" => self.kind.as_str());
        transition
    }

    async fn deliver(&self, key: &ObjectKey, transition: &Transition) {
        let handler = Arc::clone(&self.handler);
        let call = async move {
            match transition {
                Transition::Create(obj) => handler.on_create(obj).await,
                Transition::Update { old, new } => handler.on_update(old, new).await,
                Transition::Delete(obj) => handler.on_delete(obj).await,
            }
        };
        let event = transition.label();
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(kind = %self.kind, key = %key, event, "handler ok");
                counter!("kwatch_events_total", 1, "kind" => self.kind.as_str(), "event" => event);
            }
            Ok(Err(e)) => {
                warn!(kind = %self.kind, key = %key, event, error = ?e, "handler failed; event dropped");
                counter!("kwatch_handler_errors_total", 1, "kind" => self.kind.as_str(), "event" => event);
            }
            Err(_) => {
                error!(kind = %self.kind, key = %key, event, "handler panicked; event dropped");
                counter!("kwatch_handler_errors_total", 1, "kind" => self.kind.as_str(), "event" => event);
            }
        }
    }
}
