//! duralog - write-ahead log and overflow log engine for embedded storage
//!
//! Group-committed WAL with a shared block cache, a background applier that
//! drains flushed records into the row layer, and compacted overflow logs for
//! payloads too large to live in the WAL.

pub mod applier;
pub mod cache;
pub mod cancel;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod crash_point;
pub mod engine;
pub mod fileio;
pub mod observability;
pub mod overflow;
pub mod recovery;
pub mod rows;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, EngineResult};
