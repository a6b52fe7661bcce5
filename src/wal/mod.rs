//! Write-ahead log
//!
//! The WAL is a sequence of pre-sized files named by a monotonic log id.
//! Positions `(log_id, offset)` are totally ordered. Every file starts with
//! a Header record; a file that fills up ends with a NewLog record naming
//! its successor.
//!
//! - `writer`: double-buffered appends, group commit, flush frontier
//! - `reader`: strict sequential reads for recovery and the applier
//! - `files`: file naming, pre-sizing, spare reuse, cached reads
//! - `checkpoint`: the replay start position
//! - `sequence`: operation sequence numbers carried by records
//!
//! # Invariants
//!
//! - Everything before the flush frontier is on disk. A commit returns only
//!   once the frontier has passed its record.
//! - The frontier never moves backwards, and appends never land below it.
//! - A failed flush poisons the writer. Every waiter of that round and every
//!   later caller gets `FlushFailed`; nothing is retried in place.
//! - Recovery stops at the first record that does not decode. The next log
//!   links back to that position, so a torn tail is never appended to.
//! - Files before the checkpoint's log may be retired; nothing at or after
//!   it is.

mod buffer;
mod checkpoint;
mod errors;
mod files;
mod position;
mod reader;
mod sequence;
mod writer;

pub use checkpoint::Checkpoint;
pub use errors::{Severity, WalError, WalResult};
pub use files::WalFiles;
pub use position::LogPosition;
pub use reader::{LogSource, WalReader};
pub use sequence::OpSequence;
pub use writer::{FlushObserver, WalWriter};
