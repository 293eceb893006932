//! kwatch store: per-key coalescing delta queue, indexed object store and the dispatch loop
//! that turns drained deltas into handler calls.

#![forbid(unsafe_code)]

mod dispatch;
mod index;
mod queue;

pub use dispatch::Dispatcher;
pub use index::{IndexedStore, KnownObjects, StoreReader};
pub use queue::{Batch, DeltaQueue, ReplaceReport};
