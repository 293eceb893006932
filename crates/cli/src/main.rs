#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use kwatch_controller::{handlers, liveness, Config, HandlerKind, KubeSourceFactory, Supervisor};
use kwatch_core::ResourceKind;
use kwatch_kubehub::KubeSource;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kwatch", version, about = "Watch Kubernetes resources and dispatch create/update/delete events")]
struct Cli {
    /// YAML config file; flags below override it
    #[arg(short = 'c', long = "config", env = "KWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Watch pods
    #[arg(long = "pod", env = "KWATCH_POD", action = ArgAction::SetTrue)]
    pod: bool,
    /// Watch services
    #[arg(long = "services", env = "KWATCH_SERVICES", action = ArgAction::SetTrue)]
    services: bool,
    /// Watch replication controllers
    #[arg(long = "replicationcontroller", env = "KWATCH_REPLICATIONCONTROLLER", action = ArgAction::SetTrue)]
    replication_controller: bool,
    /// Watch deployments
    #[arg(long = "deployment", env = "KWATCH_DEPLOYMENT", action = ArgAction::SetTrue)]
    deployment: bool,
    /// Watch replica sets
    #[arg(long = "replicaset", env = "KWATCH_REPLICASET", action = ArgAction::SetTrue)]
    replica_set: bool,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", env = "KWATCH_NAMESPACE")]
    namespace: Option<String>,
    /// Label selector applied to list and watch
    #[arg(short = 'l', long = "selector", env = "KWATCH_LABEL_SELECTOR")]
    label_selector: Option<String>,
    /// Field selector applied to list and watch
    #[arg(long = "field-selector", env = "KWATCH_FIELD_SELECTOR")]
    field_selector: Option<String>,

    /// Full resync period in seconds
    #[arg(long = "resync-secs", env = "KWATCH_RESYNC_SECS")]
    resync_secs: Option<u64>,
    /// First reconnect delay in milliseconds
    #[arg(long = "backoff-base-ms", env = "KWATCH_BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,
    /// Reconnect delay cap in milliseconds
    #[arg(long = "backoff-max-ms", env = "KWATCH_BACKOFF_MAX_MS")]
    backoff_max_ms: Option<u64>,

    /// Liveness listener, host:port
    #[arg(long = "liveness-addr", env = "KWATCH_LIVENESS_ADDR")]
    liveness_addr: Option<String>,

    /// Event handler
    #[arg(long = "handler", value_enum, env = "KWATCH_HANDLER")]
    handler: Option<HandlerArg>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum HandlerArg {
    Log,
    Json,
}

impl From<HandlerArg> for HandlerKind {
    fn from(h: HandlerArg) -> Self {
        match h {
            HandlerArg::Log => HandlerKind::Log,
            HandlerArg::Json => HandlerKind::Json,
        }
    }
}

impl Cli {
    /// File (or defaults) first, then flags. Kind toggles only ever switch a kind on.
    fn into_config(self) -> Result<Config> {
        let mut cfg = match self.config.as_deref() {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let toggles = [
            (ResourceKind::Pod, self.pod),
            (ResourceKind::Service, self.services),
            (ResourceKind::ReplicationController, self.replication_controller),
            (ResourceKind::Deployment, self.deployment),
            (ResourceKind::ReplicaSet, self.replica_set),
        ];
        for (kind, on) in toggles {
            if on {
                cfg.resource.enable(kind);
            }
        }
        if self.namespace.is_some() {
            cfg.scope.namespace = self.namespace;
        }
        if self.label_selector.is_some() {
            cfg.scope.label_selector = self.label_selector;
        }
        if self.field_selector.is_some() {
            cfg.scope.field_selector = self.field_selector;
        }
        if let Some(v) = self.resync_secs {
            cfg.resync_secs = v;
        }
        if let Some(v) = self.backoff_base_ms {
            cfg.backoff.base_delay_ms = v;
        }
        if let Some(v) = self.backoff_max_ms {
            cfg.backoff.max_delay_ms = v;
        }
        if let Some(v) = self.liveness_addr {
            cfg.liveness_addr = v;
        }
        if let Some(h) = self.handler {
            cfg.handler = h.into();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn init_tracing() {
    let env = std::env::var("KWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = term => info!("SIGTERM received"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();

    let cfg = Cli::parse().into_config().context("loading configuration")?;
    let liveness_addr = cfg.liveness_socket()?;
    info!(
        kinds = ?cfg.enabled_kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        namespace = cfg.scope.namespace.as_deref().unwrap_or("<all>"),
        resync_secs = cfg.resync_secs,
        handler = ?cfg.handler,
        "starting kwatch"
    );

    let client = KubeSource::connect().await?;
    let sources = KubeSourceFactory::new(client, cfg.scope.clone());
    let token = CancellationToken::new();
    let supervisor = Supervisor::start(&cfg, handlers::build_handler(cfg.handler), &sources, token.clone());

    let (_, liveness) = match liveness::serve(liveness_addr, supervisor.pipelines().to_vec(), token.clone()) {
        Ok(v) => v,
        Err(e) => {
            token.cancel();
            supervisor.wait().await;
            return Err(e);
        }
    };

    shutdown_signal().await;
    info!("shutting down");
    token.cancel();
    supervisor.wait().await;
    liveness.await.context("liveness task")?;
    info!("bye");
    Ok(())
}
