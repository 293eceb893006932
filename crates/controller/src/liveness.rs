//! Liveness and diagnostics HTTP endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Context;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::{Filter, Rejection, Reply};

use crate::supervisor::PipelineHandle;

/// `GET /healthz` answers `ok` while the process runs; `GET /status` reports every pipeline.
pub fn routes(pipelines: Vec<PipelineHandle>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let healthz = warp::path!("healthz").and(warp::get()).map(|| "ok");
    let status = warp::path!("status")
        .and(warp::get())
        .and(warp::any().map(move || pipelines.clone()))
        .and_then(status_handler);
    healthz.or(status)
}

async fn status_handler(pipelines: Vec<PipelineHandle>) -> Result<impl Reply, Infallible> {
    let body: Vec<serde_json::Value> = pipelines
        .iter()
        .map(|p| {
            json!({
                "kind": p.kind,
                "alive": p.alive(),
                "objects": p.store.len(),
                "status": &*p.status.current(),
            })
        })
        .collect();
    Ok(warp::reply::json(&body))
}

/// Bind `addr` and serve until `shutdown` fires. A bind failure is returned to the caller.
pub fn serve(
    addr: SocketAddr,
    pipelines: Vec<PipelineHandle>,
    shutdown: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let (bound, server) = warp::serve(routes(pipelines))
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .with_context(|| format!("binding liveness endpoint on {}", addr))?;
    info!(addr = %bound, "liveness endpoint listening");
    Ok((bound, tokio::spawn(server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_answers_ok() {
        let api = routes(Vec::new());
        let res = warp::test::request().method("GET").path("/healthz").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.body().as_ref(), b"ok");
    }

    #[tokio::test]
    async fn status_without_pipelines_is_empty_list() {
        let api = routes(Vec::new());
        let res = warp::test::request().method("GET").path("/status").reply(&api).await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let api = routes(Vec::new());
        let res = warp::test::request().method("GET").path("/nope").reply(&api).await;
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn serve_binds_and_stops_on_shutdown() {
        let token = CancellationToken::new();
        let (bound, task) = serve(([127, 0, 0, 1], 0).into(), Vec::new(), token.clone()).unwrap();
        assert_ne!(bound.port(), 0);
        let second = serve(bound, Vec::new(), token.clone());
        assert!(second.is_err(), "port already taken");
        token.cancel();
        task.await.unwrap();
    }
}
