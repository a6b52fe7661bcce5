//! WAL error types
//!
//! Codes:
//! - DURALOG_WAL_IO (ERROR)
//! - DURALOG_WAL_FLUSH_FAILED (FATAL)
//! - DURALOG_WAL_CORRUPTION (FATAL)
//! - DURALOG_WAL_RECORD_TOO_LARGE (ERROR)
//! - DURALOG_WAL_CLOSED (ERROR)

use std::fmt;
use std::io;

use thiserror::Error;

use super::position::LogPosition;
use crate::cache::CacheError;
use crate::codec::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation fails; the engine keeps running.
    Error,
    /// Durability can no longer be guaranteed.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("[ERROR] DURALOG_WAL_IO: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A flush round failed. Every waiter of that round, and every later
    /// caller, receives this.
    #[error("[FATAL] DURALOG_WAL_FLUSH_FAILED: {0}")]
    FlushFailed(String),

    #[error("[FATAL] DURALOG_WAL_CORRUPTION: at {position}: {reason}")]
    Corruption { position: LogPosition, reason: String },

    #[error("[ERROR] DURALOG_WAL_RECORD_TOO_LARGE: record of {len} bytes exceeds {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("[ERROR] DURALOG_WAL_CLOSED: the log writer is closed")]
    Closed,

    #[error("[ERROR] {0}")]
    Codec(#[from] CodecError),

    #[error("[ERROR] {0}")]
    Cache(#[from] CacheError),
}

impl WalError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        WalError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corruption(position: LogPosition, reason: impl Into<String>) -> Self {
        WalError::Corruption {
            position,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            WalError::Io { .. } => "DURALOG_WAL_IO",
            WalError::FlushFailed(_) => "DURALOG_WAL_FLUSH_FAILED",
            WalError::Corruption { .. } => "DURALOG_WAL_CORRUPTION",
            WalError::RecordTooLarge { .. } => "DURALOG_WAL_RECORD_TOO_LARGE",
            WalError::Closed => "DURALOG_WAL_CLOSED",
            WalError::Codec(e) => e.code(),
            WalError::Cache(e) => e.code(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            WalError::FlushFailed(_) | WalError::Corruption { .. } => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type WalResult<T> = Result<T, WalError>;
