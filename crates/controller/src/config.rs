//! Runtime configuration. Loaded from an optional YAML file (kubewatch-compatible
//! `resource:` section) and then overridden by flags/env in the binary.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use kwatch_core::ResourceKind;
use kwatch_kubehub::{BackoffPolicy, ReflectorConfig, WatchScope};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One toggle per watchable kind.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceToggles {
    #[serde(default)]
    pub pod: bool,
    #[serde(default)]
    pub services: bool,
    #[serde(default, rename = "replicationcontroller")]
    pub replication_controller: bool,
    #[serde(default)]
    pub deployment: bool,
    #[serde(default, rename = "replicaset")]
    pub replica_set: bool,
}

impl ResourceToggles {
    pub fn enabled(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Pod => self.pod,
            ResourceKind::Service => self.services,
            ResourceKind::ReplicationController => self.replication_controller,
            ResourceKind::Deployment => self.deployment,
            ResourceKind::ReplicaSet => self.replica_set,
        }
    }

    pub fn enable(&mut self, kind: ResourceKind) {
        match kind {
            ResourceKind::Pod => self.pod = true,
            ResourceKind::Service => self.services = true,
            ResourceKind::ReplicationController => self.replication_controller = true,
            ResourceKind::Deployment => self.deployment = true,
            ResourceKind::ReplicaSet => self.replica_set = true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Structured log line per event
    #[default]
    Log,
    /// One JSON document per event on stdout
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub resource: ResourceToggles,

    #[serde(default)]
    pub scope: WatchScope,

    /// Full resync period (unit: seconds)
    #[serde(default = "default_resync_secs")]
    pub resync_secs: u64,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default = "default_liveness_addr")]
    pub liveness_addr: String,

    #[serde(default)]
    pub handler: HandlerKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resource: ResourceToggles::default(),
            scope: WatchScope::default(),
            resync_secs: default_resync_secs(),
            backoff: BackoffPolicy::default(),
            liveness_addr: default_liveness_addr(),
            handler: HandlerKind::default(),
        }
    }
}

fn default_resync_secs() -> u64 {
    30 * 60
}
fn default_liveness_addr() -> String {
    "0.0.0.0:8081".to_string()
}

impl Config {
    pub fn from_yaml_str(s: &str, origin: &str) -> Result<Self, ConfigError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(s).map_err(|source| ConfigError::Parse { path: origin.to_string(), source })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        Self::from_yaml_str(&text, &display)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_secs == 0 {
            return Err(ConfigError::Invalid("resync_secs must be greater than zero".into()));
        }
        if self.backoff.base_delay_ms == 0 || self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base_delay_ms ({}) must be in 1..=max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        self.liveness_socket()?;
        Ok(())
    }

    /// Kinds to run a pipeline for, in a stable order.
    pub fn enabled_kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL.into_iter().filter(|k| self.resource.enabled(*k)).collect()
    }

    pub fn resync_period(&self) -> Duration { Duration::from_secs(self.resync_secs) }

    pub fn reflector_config(&self) -> ReflectorConfig {
        ReflectorConfig { resync_period: self.resync_period(), backoff: self.backoff }
    }

    pub fn liveness_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.liveness_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("liveness_addr {:?} is not host:port", self.liveness_addr)))
    }
}
