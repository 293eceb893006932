//! Built-in handlers selectable from configuration.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use kwatch_core::{Handler, Object};
use serde::Serialize;
use tracing::info;

use crate::config::HandlerKind;

pub fn build_handler(kind: HandlerKind) -> Arc<dyn Handler> {
    match kind {
        HandlerKind::Log => Arc::new(LogHandler),
        HandlerKind::Json => Arc::new(JsonHandler::stdout()),
    }
}

/// Emits one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait::async_trait]
impl Handler for LogHandler {
    async fn on_create(&self, obj: &Object) -> anyhow::Result<()> {
        info!(event = "create", kind = %obj.kind, key = %obj.key, rv = %obj.resource_version, "object created");
        Ok(())
    }

    async fn on_update(&self, old: &Object, new: &Object) -> anyhow::Result<()> {
        info!(
            event = "update",
            kind = %new.kind,
            key = %new.key,
            old_rv = %old.resource_version,
            rv = %new.resource_version,
            "object updated"
        );
        Ok(())
    }

    async fn on_delete(&self, obj: &Object) -> anyhow::Result<()> {
        info!(event = "delete", kind = %obj.kind, key = %obj.key, rv = %obj.resource_version, "object deleted");
        Ok(())
    }
}

#[derive(Serialize)]
struct Record<'a> {
    event: &'static str,
    kind: &'static str,
    key: String,
    resource_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_resource_version: Option<&'a str>,
    timestamp: String,
    object: &'a serde_json::Value,
}

/// Writes one JSON document per line.
pub struct JsonHandler {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonHandler {
    pub fn stdout() -> Self { Self::with_writer(Box::new(std::io::stdout())) }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self { Self { out: Mutex::new(out) } }

    fn emit(&self, event: &'static str, obj: &Object, old: Option<&Object>) -> anyhow::Result<()> {
        let record = Record {
            event,
            kind: obj.kind.as_str(),
            key: obj.key.to_string(),
            resource_version: obj.resource_version.as_str(),
            old_resource_version: old.map(|o| o.resource_version.as_str()),
            timestamp: Utc::now().to_rfc3339(),
            object: &obj.raw,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for JsonHandler {
    async fn on_create(&self, obj: &Object) -> anyhow::Result<()> { self.emit("create", obj, None) }

    async fn on_update(&self, old: &Object, new: &Object) -> anyhow::Result<()> { self.emit("update", new, Some(old)) }

    async fn on_delete(&self, obj: &Object) -> anyhow::Result<()> { self.emit("delete", obj, None) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::{ObjectKey, ResourceKind};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
    }

    fn deployment(rv: &str) -> Object {
        Object::new(
            ResourceKind::Deployment,
            ObjectKey::namespaced("prod", "web"),
            rv,
            serde_json::json!({"metadata": {"name": "web", "namespace": "prod", "resourceVersion": rv}}),
        )
    }

    #[tokio::test]
    async fn json_handler_writes_one_line_per_event() {
        let buf = SharedBuf::default();
        let h = JsonHandler::with_writer(Box::new(buf.clone()));
        h.on_create(&deployment("1")).await.unwrap();
        h.on_update(&deployment("1"), &deployment("2")).await.unwrap();
        h.on_delete(&deployment("2")).await.unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "create");
        assert_eq!(lines[0]["kind"], "deployment");
        assert_eq!(lines[0]["key"], "prod/web");
        assert!(lines[0].get("old_resource_version").is_none());
        assert_eq!(lines[1]["event"], "update");
        assert_eq!(lines[1]["old_resource_version"], "1");
        assert_eq!(lines[1]["resource_version"], "2");
        assert_eq!(lines[2]["object"]["metadata"]["name"], "web");
    }

    #[tokio::test]
    async fn log_handler_never_fails() {
        let h = build_handler(HandlerKind::Log);
        h.on_create(&deployment("1")).await.unwrap();
        h.on_update(&deployment("1"), &deployment("2")).await.unwrap();
        h.on_delete(&deployment("2")).await.unwrap();
    }
}
