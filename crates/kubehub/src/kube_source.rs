use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, ReplicationController, Service};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    Client,
};
use kwatch_core::{Object, ResourceKind, ResourceVersion, SourceError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::source::{ChangeSource, ListPage, WatchEvent, WatchStream};

/// Server-side watch timeout; the server closes the stream after this many seconds.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Namespace and selectors applied to both list and watch. `namespace: None` means all
/// namespaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchScope {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub field_selector: Option<String>,
}

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
        ResourceKind::Service => ApiResource::erase::<Service>(&()),
        ResourceKind::ReplicationController => ApiResource::erase::<ReplicationController>(&()),
        ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
        ResourceKind::ReplicaSet => ApiResource::erase::<ReplicaSet>(&()),
    }
}

/// [`ChangeSource`] backed by the Kubernetes API.
pub struct KubeSource {
    kind: ResourceKind,
    api: Api<DynamicObject>,
    scope: WatchScope,
}

impl KubeSource {
    pub fn new(client: Client, kind: ResourceKind, scope: WatchScope) -> Self {
        let ar = api_resource(kind);
        let api: Api<DynamicObject> = match scope.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        Self { kind, api, scope }
    }

    /// Build a client from the ambient kubeconfig / in-cluster env and make sure the API
    /// server answers.
    pub async fn connect() -> Result<Client> {
        let client = Client::try_default().await.context("building kube client")?;
        let version = client.apiserver_version().await.context("reaching kube api server")?;
        info!(git_version = %version.git_version, platform = %version.platform, "connected to api server");
        Ok(client)
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = self.scope.label_selector.as_deref() {
            lp = lp.labels(l);
        }
        if let Some(f) = self.scope.field_selector.as_deref() {
            lp = lp.fields(f);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(l) = self.scope.label_selector.as_deref() {
            wp = wp.labels(l);
        }
        if let Some(f) = self.scope.field_selector.as_deref() {
            wp = wp.fields(f);
        }
        wp
    }
}

fn from_response(resp: ErrorResponse) -> SourceError {
    if resp.code == 410 {
        SourceError::Gone(resp.message)
    } else {
        SourceError::Transport(format!("{} ({} {})", resp.message, resp.code, resp.reason))
    }
}

fn map_kube_err(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) => from_response(resp),
        kube::Error::SerdeError(e) => SourceError::Decode(e.to_string()),
        other => SourceError::Transport(other.to_string()),
    }
}

fn to_object(kind: ResourceKind, obj: DynamicObject) -> Result<Object, SourceError> {
    let raw = serde_json::to_value(&obj).map_err(|e| SourceError::Decode(e.to_string()))?;
    Object::from_raw(kind, raw)
}

fn to_event(kind: ResourceKind, ev: kube::Result<KubeEvent<DynamicObject>>) -> Result<WatchEvent, SourceError> {
    match ev.map_err(map_kube_err)? {
        KubeEvent::Added(o) => to_object(kind, o).map(WatchEvent::Added),
        KubeEvent::Modified(o) => to_object(kind, o).map(WatchEvent::Modified),
        KubeEvent::Deleted(o) => to_object(kind, o).map(WatchEvent::Deleted),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(ResourceVersion::from(b.metadata.resource_version))),
        KubeEvent::Error(resp) => Err(from_response(resp)),
    }
}

#[async_trait::async_trait]
impl ChangeSource for KubeSource {
    async fn list(&self) -> Result<ListPage, SourceError> {
        let list = self.api.list(&self.list_params()).await.map_err(map_kube_err)?;
        let resource_version = list
            .metadata
            .resource_version
            .clone()
            .filter(|rv| !rv.is_empty())
            .map(ResourceVersion::from)
            .ok_or_else(|| SourceError::Transport("list response missing metadata.resourceVersion".into()))?;
        let mut items = Vec::with_capacity(list.items.len());
        let mut undecoded = 0;
        for o in list.items {
            match to_object(self.kind, o) {
                Ok(obj) => items.push(obj),
                Err(e) => {
                    undecoded += 1;
                    warn!(kind = %self.kind, error = %e, "skipping undecodable list item");
                    counter!("kwatch_decode_errors_total", 1, "kind" => self.kind.as_str());
                }
            }
        }
        Ok(ListPage { items, resource_version, undecoded })
    }

    async fn watch(&self, resource_version: &ResourceVersion) -> Result<WatchStream, SourceError> {
        let stream = self
            .api
            .watch(&self.watch_params(), resource_version.as_str())
            .await
            .map_err(map_kube_err)?;
        let kind = self.kind;
        Ok(stream.map(move |ev| to_event(kind, ev)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resources_match_kinds() {
        let keys: Vec<String> = ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let ar = api_resource(kind);
                format!("{}/{}/{}", ar.group, ar.version, ar.kind)
            })
            .collect();
        assert_eq!(
            keys,
            vec!["/v1/Pod", "/v1/Service", "/v1/ReplicationController", "apps/v1/Deployment", "apps/v1/ReplicaSet"]
        );
    }

    #[test]
    fn gone_is_distinguished_from_transport() {
        let gone = ErrorResponse { status: "Failure".into(), message: "too old resource version".into(), reason: "Expired".into(), code: 410 };
        assert!(from_response(gone).is_gone());
        let forbidden = ErrorResponse { status: "Failure".into(), message: "forbidden".into(), reason: "Forbidden".into(), code: 403 };
        assert!(matches!(from_response(forbidden), SourceError::Transport(_)));
    }

    #[test]
    fn dynamic_objects_convert_with_identity() {
        let ar = api_resource(ResourceKind::Service);
        let mut o = DynamicObject::new("web", &ar).within("prod");
        o.metadata.resource_version = Some("17".into());
        let obj = to_object(ResourceKind::Service, o).unwrap();
        assert_eq!(obj.key.to_string(), "prod/web");
        assert_eq!(obj.resource_version.as_str(), "17");

        let bare = DynamicObject::new("web", &ar);
        assert!(matches!(to_object(ResourceKind::Service, bare), Err(SourceError::Decode(_))));
    }
}
