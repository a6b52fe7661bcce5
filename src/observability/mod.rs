//! Engine statistics
//!
//! Counters are plain relaxed atomics: cheap on hot paths, exact once the
//! engine is quiescent. Logging goes through `tracing`; this module only
//! carries numbers.

mod metrics;

pub use metrics::{Counter, Metrics, MetricsSnapshot};
