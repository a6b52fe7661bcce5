//! Overflow Logs
//!
//! Payloads too large for a WAL record are appended to overflow logs and the
//! WAL carries only their address. Logs fill up, accumulate garbage as rows
//! are replaced or deleted, get compacted once the garbage ratio crosses the
//! configured threshold, and are then retired: deleted, or renamed to a free
//! id and reused.
//!
//! # Invariants
//!
//! - A record verifies only under the (log id, generation) it was written
//!   for. A recycled file gets a new id and the next generation, so bytes
//!   left from any earlier life never read back as live data, even when an
//!   id returns to the same file.
//! - Every registered log is in exactly one state, and only HasSpace logs
//!   nobody holds are handed out for writing.
//! - A write handle is exclusive: one appender per log at a time.
//! - Garbage only grows until a compaction pass resets it. A log is retired
//!   only from Compacted or ToDelete, and never while a free of one of its
//!   records is in flight.

mod errors;
mod format;
mod queue;
mod scan;
mod store;

pub use errors::{OverflowError, OverflowResult};
pub use format::{OVERFLOW_HEADER_LEN, OVERFLOW_RECORD_HEADER_LEN};
pub use queue::CompactionQueue;
pub use store::{FreeReason, LiveRecord, LogInfo, LogState, OverflowStore, OverflowWriteHandle};
