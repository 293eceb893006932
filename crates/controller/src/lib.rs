//! kwatch controller: configuration, the supervisor that runs one pipeline per enabled
//! resource kind, built-in handlers and the liveness endpoint.

#![forbid(unsafe_code)]

pub mod config;
pub mod handlers;
pub mod liveness;
mod supervisor;

pub use config::{Config, ConfigError, HandlerKind, ResourceToggles};
pub use supervisor::{KubeSourceFactory, PipelineHandle, SourceFactory, Supervisor};
