//! Overflow log error types
//!
//! Codes:
//! - DURALOG_OVERFLOW_IO (ERROR)
//! - DURALOG_OVERFLOW_ID_SPACE_EXHAUSTED (FATAL)
//! - DURALOG_OVERFLOW_NO_SUCH_LOG (ERROR)
//! - DURALOG_OVERFLOW_BAD_ADDRESS (ERROR)
//! - DURALOG_OVERFLOW_RECORD_MISMATCH (ERROR)
//! - DURALOG_OVERFLOW_PAYLOAD_TOO_LARGE (ERROR)

use std::io;

use thiserror::Error;

use crate::cache::CacheError;
use crate::codec::OverflowAddress;
use crate::wal::Severity;

#[derive(Debug, Error)]
pub enum OverflowError {
    #[error("[ERROR] DURALOG_OVERFLOW_IO: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Every log id up to the configured maximum is in use. Raise
    /// `max_overflow_logs` or `overflow_log_size`.
    #[error("[FATAL] DURALOG_OVERFLOW_ID_SPACE_EXHAUSTED: all {max} overflow log ids are in use")]
    IdSpaceExhausted { max: u32 },

    #[error("[ERROR] DURALOG_OVERFLOW_NO_SUCH_LOG: overflow log {0} does not exist")]
    NoSuchLog(u32),

    #[error("[ERROR] DURALOG_OVERFLOW_BAD_ADDRESS: {addr:?}: {reason}")]
    BadAddress {
        addr: OverflowAddress,
        reason: String,
    },

    #[error("[ERROR] DURALOG_OVERFLOW_RECORD_MISMATCH: {addr:?} does not hold the expected record")]
    RecordMismatch { addr: OverflowAddress },

    #[error("[ERROR] DURALOG_OVERFLOW_PAYLOAD_TOO_LARGE: {len} bytes exceeds {max}")]
    PayloadTooLarge { len: u64, max: u64 },

    #[error("[ERROR] {0}")]
    Cache(#[from] CacheError),
}

impl OverflowError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        OverflowError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn bad_address(addr: OverflowAddress, reason: impl Into<String>) -> Self {
        OverflowError::BadAddress {
            addr,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OverflowError::Io { .. } => "DURALOG_OVERFLOW_IO",
            OverflowError::IdSpaceExhausted { .. } => "DURALOG_OVERFLOW_ID_SPACE_EXHAUSTED",
            OverflowError::NoSuchLog(_) => "DURALOG_OVERFLOW_NO_SUCH_LOG",
            OverflowError::BadAddress { .. } => "DURALOG_OVERFLOW_BAD_ADDRESS",
            OverflowError::RecordMismatch { .. } => "DURALOG_OVERFLOW_RECORD_MISMATCH",
            OverflowError::PayloadTooLarge { .. } => "DURALOG_OVERFLOW_PAYLOAD_TOO_LARGE",
            OverflowError::Cache(e) => e.code(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            OverflowError::IdSpaceExhausted { .. } => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type OverflowResult<T> = Result<T, OverflowError>;
