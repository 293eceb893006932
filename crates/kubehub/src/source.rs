use futures::stream::BoxStream;
use kwatch_core::{Object, ResourceVersion, SourceError};

/// A consistent listing and the version to resume watching from.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub items: Vec<Object>,
    pub resource_version: ResourceVersion,
    /// Items the source returned but could not decode; they are missing from `items`.
    pub undecoded: usize,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    /// Progress marker: advances the tracked version without a change.
    Bookmark(ResourceVersion),
}

impl WatchEvent {
    pub fn resource_version(&self) -> &ResourceVersion {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => &o.resource_version,
            WatchEvent::Bookmark(rv) => rv,
        }
    }
}

/// Item-level errors: `Decode` skips one item, anything else ends the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// Remote collection offering list + incremental watch for one resource kind and selector.
#[async_trait::async_trait]
pub trait ChangeSource: Send + Sync {
    async fn list(&self) -> Result<ListPage, SourceError>;

    async fn watch(&self, resource_version: &ResourceVersion) -> Result<WatchStream, SourceError>;
}
