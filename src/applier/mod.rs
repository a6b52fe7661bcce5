//! Background Applier
//!
//! Drains flushed WAL records into the row layer, strictly in log order.
//!
//! The applier chases the writer's flush frontier. When it catches up it
//! idles for `apply_interval_ms`, unless one of these wakes it early:
//! - the unapplied tail grows past `applier_high_water` of the cache
//! - a `sync` or `checkpoint` caller is waiting on it
//!
//! Commits are durable before they are visible in the row layer; the gap is
//! bounded by the interval and the high-water mark.

mod applier;
mod dispatch;

pub use applier::Applier;
pub use dispatch::{Dispatched, Dispatcher};
