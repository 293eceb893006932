use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kwatch_core::{Delta, ResourceKind, SourceError};
use kwatch_store::{DeltaQueue, StoreReader};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::source::{ChangeSource, WatchEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// Full list + diff period, independent of watch health.
    pub resync_period: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ReflectorConfig {
    fn default() -> Self { Self { resync_period: Duration::from_secs(30 * 60), backoff: BackoffPolicy::default() } }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Listing,
    Watching,
    Backoff,
    Stopped,
}

/// Diagnostics published by a reflector after every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorStatus {
    pub kind: ResourceKind,
    pub phase: Phase,
    /// Last resource version seen from a list or a watch event.
    pub resource_version: Option<String>,
    pub relists: u64,
    pub last_list: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Lock-free read handle on a reflector's [`ReflectorStatus`].
#[derive(Clone)]
pub struct StatusHandle(Arc<ArcSwap<ReflectorStatus>>);

impl StatusHandle {
    fn new(kind: ResourceKind) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(ReflectorStatus {
            kind,
            phase: Phase::Starting,
            resource_version: None,
            relists: 0,
            last_list: None,
            consecutive_failures: 0,
            last_error: None,
        })))
    }

    pub fn current(&self) -> Arc<ReflectorStatus> { self.0.load_full() }

    fn update(&self, f: impl FnOnce(&mut ReflectorStatus)) {
        let mut next = ReflectorStatus::clone(&self.0.load());
        f(&mut next);
        self.0.store(Arc::new(next));
    }
}

/// Why a list+watch session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Resync,
    /// `progressed` is set when the watch delivered at least one item before expiring.
    Gone { progressed: bool },
    Closed,
    Shutdown,
}

/// Mirrors one [`ChangeSource`] into a [`DeltaQueue`]: list, reconcile against known state,
/// watch, and start over on failure, on version expiry, or when the resync period elapses.
pub struct Reflector {
    kind: ResourceKind,
    source: Arc<dyn ChangeSource>,
    queue: DeltaQueue,
    known: StoreReader,
    config: ReflectorConfig,
    status: StatusHandle,
}

impl Reflector {
    pub fn new(
        kind: ResourceKind,
        source: Arc<dyn ChangeSource>,
        queue: DeltaQueue,
        known: StoreReader,
        config: ReflectorConfig,
    ) -> Self {
        Self { kind, source, queue, known, config, status: StatusHandle::new(kind) }
    }

    pub fn status(&self) -> StatusHandle { self.status.clone() }

    /// Run until `shutdown` fires. Source failures are retried forever with backoff.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(kind = %self.kind, resync_secs = self.config.resync_period.as_secs(), "reflector started");
        let mut backoff = Backoff::new(self.config.backoff);
        // An expiry right after a fresh list relists immediately only once; repeats back off.
        let mut just_expired = false;
        loop {
            let end = self.session(&mut backoff, &shutdown).await;
            let expired_again = just_expired;
            just_expired = matches!(end, Ok(SessionEnd::Gone { .. }));
            let relist_now = match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Resync) => {
                    debug!(kind = %self.kind, "resync period elapsed");
                    true
                }
                Ok(SessionEnd::Gone { progressed }) => {
                    counter!("kwatch_watch_expired_total", 1, "kind" => self.kind.as_str());
                    if progressed || !expired_again {
                        info!(kind = %self.kind, "resource version expired; relisting");
                        true
                    } else {
                        warn!(kind = %self.kind, "resource version expired again without progress");
                        false
                    }
                }
                Ok(SessionEnd::Closed) => {
                    debug!(kind = %self.kind, "watch stream closed");
                    false
                }
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "list/watch failed");
                    counter!("kwatch_source_errors_total", 1, "kind" => self.kind.as_str());
                    self.status.update(|s| s.last_error = Some(e.to_string()));
                    false
                }
            };
            if relist_now {
                continue;
            }
            let delay = backoff.next_delay();
            let attempt = backoff.attempt();
            self.status.update(|s| {
                s.phase = Phase::Backoff;
                s.consecutive_failures = attempt;
            });
            debug!(kind = %self.kind, attempt, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.status.update(|s| s.phase = Phase::Stopped);
        info!(kind = %self.kind, "reflector stopped");
    }

    /// One list, then one watch until it ends.
    async fn session(&self, backoff: &mut Backoff, shutdown: &CancellationToken) -> Result<SessionEnd, SourceError> {
        self.status.update(|s| s.phase = Phase::Listing);
        let started = Instant::now();
        let page = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            page = self.source.list() => page?,
        };
        let mut rv = page.resource_version;
        let report = if page.undecoded == 0 {
            self.queue.replace(page.items, &self.known)
        } else {
            warn!(kind = %self.kind, undecoded = page.undecoded, "partial listing; not pruning missing keys");
            self.queue.merge(page.items, &self.known)
        };
        let took_ms = started.elapsed().as_millis() as u64;
        histogram!("kwatch_list_ms", took_ms as f64, "kind" => self.kind.as_str());
        counter!("kwatch_relists_total", 1, "kind" => self.kind.as_str());
        info!(
            kind = %self.kind,
            rv = %rv,
            listed = report.listed,
            unchanged = report.unchanged,
            upserted = report.upserted,
            deleted = report.deleted,
            took_ms,
            "list reconciled"
        );
        let listed_rv = rv.to_string();
        self.status.update(|s| {
            s.relists += 1;
            s.last_list = Some(Utc::now());
            s.resource_version = Some(listed_rv);
            s.last_error = None;
        });

        let resync_at = tokio::time::Instant::now() + self.config.resync_period;
        let mut stream = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            _ = tokio::time::sleep_until(resync_at) => return Ok(SessionEnd::Resync),
            watch = self.source.watch(&rv) => match watch {
                Ok(s) => s,
                Err(e) if e.is_gone() => return Ok(SessionEnd::Gone { progressed: false }),
                Err(e) => return Err(e),
            },
        };
        self.status.update(|s| s.phase = Phase::Watching);
        debug!(kind = %self.kind, rv = %rv, "watching");

        let mut progressed = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                _ = tokio::time::sleep_until(resync_at) => {
                    backoff.reset();
                    return Ok(SessionEnd::Resync);
                }
                item = stream.next() => item,
            };
            match item {
                None => return Ok(SessionEnd::Closed),
                Some(Ok(ev)) => {
                    progressed = true;
                    backoff.reset();
                    rv = ev.resource_version().clone();
                    self.forward(ev);
                    let seen = rv.to_string();
                    self.status.update(|s| {
                        s.resource_version = Some(seen);
                        s.consecutive_failures = 0;
                    });
                }
                Some(Err(SourceError::Decode(msg))) => {
                    warn!(kind = %self.kind, error = %msg, "skipping undecodable watch event");
                    counter!("kwatch_decode_errors_total", 1, "kind" => self.kind.as_str());
                }
                Some(Err(e)) if e.is_gone() => return Ok(SessionEnd::Gone { progressed }),
                Some(Err(e)) => return Err(e),
            }
        }
    }

    fn forward(&self, ev: WatchEvent) {
        let delta = match ev {
            WatchEvent::Added(o) => Delta::added(o),
            WatchEvent::Modified(o) => Delta::modified(o),
            WatchEvent::Deleted(o) => Delta::deleted(o),
            WatchEvent::Bookmark(_) => return,
        };
        counter!("kwatch_watch_events_total", 1, "kind" => self.kind.as_str());
        self.queue.push(delta);
    }
}
