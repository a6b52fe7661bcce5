//! Compactor
//!
//! Copying garbage collector for overflow logs. One victim at a time:
//!
//! 1. Wait for payloads written into the victim but not yet applied.
//! 2. Copy each live record, still referenced by its row, into a log picked
//!    by the normal allocator, and log a RecordMoved for it.
//! 3. At the end of the victim, mark it Compacted.
//! 4. Once every touched table has applied its last move, log a DeleteLog.
//!    The applier retires the file when it reaches that record.
//!
//! # Invariants
//!
//! - A copy is written and synced before its RecordMoved is logged.
//! - A RecordMoved repoints a row only if the row still points at the old
//!   address. A row changed in the meantime keeps its newer image, and the
//!   orphaned copy is freed.
//! - No DeleteLog is logged while a row may still point into the victim.
//! - A pass that stops part way resumes from the offset saved in the
//!   victim's header.

mod compactor;
mod watermark;

pub use compactor::{Compactor, CompactorDeps};
pub use watermark::Watermarks;
