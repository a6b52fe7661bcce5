//! Record Codec
//!
//! On-disk shapes of WAL records and the checksum that binds each record to
//! the log it was written under.
//!
//! # Record layout
//!
//! ```text
//! +------+-----------------+----------------------+
//! | kind | checksum (1|2B) | kind-specific body   |
//! +------+-----------------+----------------------+
//! ```
//!
//! Kind `0` never appears in a written record. WAL files are pre-sized with
//! zeros, so a zero kind byte marks space the writer has not reached yet.
//!
//! The checksum covers the kind byte and the body, and is offset by the log
//! id. A record copied (or left behind) in a file that now carries another
//! log id fails verification.

mod checksum;
mod errors;
mod kind;
mod record;
mod types;

pub use checksum::{wal_checksum, CRC_LEN_U16, CRC_LEN_U8};
pub use errors::{CodecError, CodecResult};
pub use kind::RecordKind;
pub use record::{decode, Decoded, LogRecord, RecordMove, RowChange, RowRef, WAL_MAGIC};
pub use types::{OverflowAddress, Payload, RowId, TableId, TxnId, OVERFLOW_ADDRESS_LEN};

/// Upper bound on everything in a record except an inline payload.
pub const MAX_RECORD_OVERHEAD: usize = 64;
