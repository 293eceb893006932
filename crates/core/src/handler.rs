use crate::Object;

/// Consumer of classified events. One call per effective transition, issued sequentially by
/// the dispatch loop of the pipeline that owns the object.
///
/// Errors are logged by the caller and never retried. A slow implementation stalls only its
/// own pipeline.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn on_create(&self, obj: &Object) -> anyhow::Result<()>;

    async fn on_update(&self, old: &Object, new: &Object) -> anyhow::Result<()>;

    async fn on_delete(&self, obj: &Object) -> anyhow::Result<()>;
}
