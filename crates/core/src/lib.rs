//! kwatch core types: object identity, deltas, classified transitions and the handler seam.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod handler;
mod object;

pub use handler::Handler;
pub use object::Object;

/// The resource kinds a pipeline can be bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Service,
    ReplicationController,
    Deployment,
    ReplicaSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::ReplicationController,
        ResourceKind::Deployment,
        ResourceKind::ReplicaSet,
    ];

    /// Short lowercase name, used as a metric label and in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::ReplicationController => "replicationcontroller",
            ResourceKind::Deployment => "deployment",
            ResourceKind::ReplicaSet => "replicaset",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Stable identity of an object within one collection: `namespace/name`, or `name` when
/// cluster scoped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Opaque token marking a point in a collection's change stream. Only equality is
/// meaningful to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self { Self(v) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeltaKind {
    Added,
    Modified,
    Deleted,
}

/// One observed or synthesized change for one object.
#[derive(Debug, Clone)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: Arc<Object>,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<Object>>) -> Self {
        Self { kind, object: object.into() }
    }

    pub fn added(object: impl Into<Arc<Object>>) -> Self { Self::new(DeltaKind::Added, object) }
    pub fn modified(object: impl Into<Arc<Object>>) -> Self { Self::new(DeltaKind::Modified, object) }
    pub fn deleted(object: impl Into<Arc<Object>>) -> Self { Self::new(DeltaKind::Deleted, object) }

    pub fn key(&self) -> &ObjectKey { &self.object.key }
}

/// A classified, handler-visible state change.
#[derive(Debug, Clone)]
pub enum Transition {
    Create(Arc<Object>),
    Update { old: Arc<Object>, new: Arc<Object> },
    Delete(Arc<Object>),
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Create(_) => "create",
            Transition::Update { .. } => "update",
            Transition::Delete(_) => "delete",
        }
    }
}

/// Classify the terminal delta of a drained batch against the prior stored value.
///
/// Returns `None` when there is nothing to tell the handler: a delete of an unknown key,
/// or a re-delivery of the exact version already stored.
pub fn classify(prior: Option<&Arc<Object>>, terminal: &Delta) -> Option<Transition> {
    match (prior, terminal.kind) {
        (None, DeltaKind::Deleted) => None,
        (Some(old), DeltaKind::Deleted) => Some(Transition::Delete(Arc::clone(old))),
        (None, _) => Some(Transition::Create(Arc::clone(&terminal.object))),
        (Some(old), _) if old.resource_version == terminal.object.resource_version => None,
        (Some(old), _) => Some(Transition::Update { old: Arc::clone(old), new: Arc::clone(&terminal.object) }),
    }
}

/// Errors raised at the change source boundary.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    /// Connection refused, stream broken, auth rejected, server-side failure.
    #[error("transport: {0}")]
    Transport(String),
    /// The tracked resource version is too old to resume from.
    #[error("resource version gone: {0}")]
    Gone(String),
    /// A single item could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_gone(&self) -> bool { matches!(self, SourceError::Gone(_)) }
}

pub mod prelude {
    pub use super::{
        classify, Delta, DeltaKind, Handler, Object, ObjectKey, ResourceKind, ResourceVersion, SourceError,
        Transition,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str, rv: &str) -> Arc<Object> {
        Arc::new(Object::new(ResourceKind::Pod, ObjectKey::namespaced("ns", name), rv, json!({})))
    }

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::namespaced("ns", "a").to_string(), "ns/a");
        assert_eq!(ObjectKey::new(None, "node-1").to_string(), "node-1");
    }

    #[test]
    fn classify_covers_each_transition() {
        let v1 = obj("a", "1");
        let v2 = obj("a", "2");
        assert!(matches!(classify(None, &Delta::added(v1.clone())), Some(Transition::Create(o)) if o.resource_version.as_str() == "1"));
        assert!(matches!(classify(None, &Delta::modified(v2.clone())), Some(Transition::Create(_))));
        match classify(Some(&v1), &Delta::modified(v2.clone())) {
            Some(Transition::Update { old, new }) => {
                assert_eq!(old.resource_version.as_str(), "1");
                assert_eq!(new.resource_version.as_str(), "2");
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert!(matches!(classify(Some(&v1), &Delta::deleted(v2.clone())), Some(Transition::Delete(o)) if o.resource_version.as_str() == "1"));
        assert!(classify(None, &Delta::deleted(v1.clone())).is_none());
    }

    #[test]
    fn same_version_is_not_an_update() {
        let v1 = obj("a", "1");
        let again = obj("a", "1");
        assert!(classify(Some(&v1), &Delta::added(again)).is_none());
    }
}
