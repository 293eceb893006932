use serde::{Deserialize, Serialize};

use crate::{ObjectKey, ResourceKind, ResourceVersion, SourceError};

/// A versioned record as last observed from the change source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Object {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub resource_version: ResourceVersion,
    /// Raw object (possibly stripped of oversized fields under feature flags)
    pub raw: serde_json::Value,
}

impl Object {
    pub fn new(kind: ResourceKind, key: ObjectKey, resource_version: impl Into<ResourceVersion>, raw: serde_json::Value) -> Self {
        Self { kind, key, resource_version: resource_version.into(), raw }
    }

    /// Build from a raw API object, reading identity and version from `metadata`.
    pub fn from_raw(kind: ResourceKind, mut raw: serde_json::Value) -> Result<Self, SourceError> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| SourceError::Decode(format!("{} object missing metadata", kind)))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SourceError::Decode(format!("{} object missing metadata.name", kind)))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let key = ObjectKey::new(namespace, name);
        let resource_version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .map(ResourceVersion::from)
            .ok_or_else(|| SourceError::Decode(format!("{} {} missing metadata.resourceVersion", kind, key)))?;
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);
        Ok(Self { kind, key, resource_version, raw })
    }

    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.key.name }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
