use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kube::Client;
use kwatch_core::{Handler, ResourceKind};
use kwatch_kubehub::{ChangeSource, KubeSource, Reflector, ReflectorConfig, StatusHandle, WatchScope};
use kwatch_store::{DeltaQueue, Dispatcher, IndexedStore, StoreReader};
use metrics::counter;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Builds the change source for one pipeline.
pub trait SourceFactory: Send + Sync {
    fn source(&self, kind: ResourceKind) -> Arc<dyn ChangeSource>;
}

/// One [`KubeSource`] per kind, sharing a client and a scope.
#[derive(Clone)]
pub struct KubeSourceFactory {
    client: Client,
    scope: WatchScope,
}

impl KubeSourceFactory {
    pub fn new(client: Client, scope: WatchScope) -> Self { Self { client, scope } }
}

impl SourceFactory for KubeSourceFactory {
    fn source(&self, kind: ResourceKind) -> Arc<dyn ChangeSource> {
        Arc::new(KubeSource::new(self.client.clone(), kind, self.scope.clone()))
    }
}

/// Read-only view on a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    pub kind: ResourceKind,
    pub store: StoreReader,
    pub status: StatusHandle,
    alive: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// False once the pipeline's tasks have exited (shutdown or a task crash).
    pub fn alive(&self) -> bool { self.alive.load(Ordering::Acquire) }
}

/// Runs one independent reflector + dispatcher pair per enabled kind.
pub struct Supervisor {
    pipelines: Vec<PipelineHandle>,
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn start(
        config: &Config,
        handler: Arc<dyn Handler>,
        sources: &dyn SourceFactory,
        shutdown: CancellationToken,
    ) -> Self {
        let reflector_config = config.reflector_config();
        let mut pipelines = Vec::new();
        let mut tasks = JoinSet::new();
        for kind in config.enabled_kinds() {
            let (handle, fut) = pipeline(kind, sources.source(kind), handler.clone(), reflector_config, shutdown.child_token());
            tasks.spawn(fut);
            pipelines.push(handle);
        }
        if pipelines.is_empty() {
            warn!("no resource kinds enabled; nothing to watch");
        } else {
            let kinds: Vec<&str> = pipelines.iter().map(|p| p.kind.as_str()).collect();
            info!(kinds = ?kinds, "pipelines started");
        }
        Self { pipelines, tasks, shutdown }
    }

    pub fn pipelines(&self) -> &[PipelineHandle] { &self.pipelines }

    /// Resolve once shutdown was requested and every pipeline has wound down. Pipelines that
    /// crash earlier are logged and not restarted; the rest keep running.
    pub async fn wait(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "pipeline task aborted");
            }
        }
        self.shutdown.cancelled().await;
        info!("all pipelines stopped");
    }
}

fn pipeline(
    kind: ResourceKind,
    source: Arc<dyn ChangeSource>,
    handler: Arc<dyn Handler>,
    config: ReflectorConfig,
    token: CancellationToken,
) -> (PipelineHandle, impl std::future::Future<Output = ()> + Send + 'static) {
    let queue = DeltaQueue::new();
    let store = IndexedStore::new();
    let reader = store.reader();
    let reflector = Reflector::new(kind, source, queue.clone(), reader.clone(), config);
    let dispatcher = Dispatcher::new(kind, queue.clone(), store, handler);
    let alive = Arc::new(AtomicBool::new(true));
    let handle = PipelineHandle { kind, store: reader, status: reflector.status(), alive: alive.clone() };

    let fut = async move {
        let mut set = JoinSet::new();
        set.spawn(reflector.run(token.clone()));
        set.spawn(dispatcher.run(token.clone()));
        while let Some(res) = set.join_next().await {
            match res {
                Ok(()) if token.is_cancelled() => {}
                Ok(()) => {
                    warn!(kind = %kind, "pipeline task exited early; stopping pipeline");
                    token.cancel();
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "pipeline task crashed; stopping pipeline");
                    counter!("kwatch_pipeline_failures_total", 1, "kind" => kind.as_str());
                    token.cancel();
                }
            }
        }
        queue.close();
        alive.store(false, Ordering::Release);
    };
    (handle, fut)
}
