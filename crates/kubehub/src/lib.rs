//! kwatch kubehub: change sources (kube-backed and pluggable) and the reflector that turns
//! list+watch into a delta stream.

#![forbid(unsafe_code)]

mod backoff;
mod kube_source;
mod reflector;
mod source;

pub use backoff::{Backoff, BackoffPolicy};
pub use kube_source::{api_resource, KubeSource, WatchScope};
pub use reflector::{Phase, Reflector, ReflectorConfig, ReflectorStatus, StatusHandle};
pub use source::{ChangeSource, ListPage, WatchEvent, WatchStream};
