//! Engine error types
//!
//! Every subsystem error converts into `EngineError`, which keeps the
//! subsystem's code and severity.
//!
//! Codes of its own:
//! - DURALOG_APPLIER_FAILED (FATAL)
//! - DURALOG_THREAD_SPAWN (ERROR)
//! - DURALOG_ENGINE_STOPPED (ERROR)

use std::io;

use thiserror::Error;

use crate::cache::CacheError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::overflow::OverflowError;
use crate::rows::RowError;
use crate::wal::{Severity, WalError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Overflow(#[from] OverflowError),

    #[error("[ERROR] {0}")]
    Row(#[from] RowError),

    #[error("[ERROR] {0}")]
    Cache(#[from] CacheError),

    #[error("[ERROR] {0}")]
    Codec(#[from] CodecError),

    /// The background applier hit an error it cannot get past.
    #[error("[FATAL] DURALOG_APPLIER_FAILED: {0}")]
    Applier(String),

    #[error("[ERROR] DURALOG_THREAD_SPAWN: failed to start {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("[ERROR] DURALOG_ENGINE_STOPPED: the engine is shutting down")]
    Stopped,
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(ConfigError::Read { .. }) => "DURALOG_CONFIG_READ",
            EngineError::Config(ConfigError::Parse(_)) => "DURALOG_CONFIG_PARSE",
            EngineError::Config(ConfigError::Invalid(_)) => "DURALOG_CONFIG_INVALID",
            EngineError::Wal(e) => e.code(),
            EngineError::Overflow(e) => e.code(),
            EngineError::Row(e) => e.code(),
            EngineError::Cache(e) => e.code(),
            EngineError::Codec(e) => e.code(),
            EngineError::Applier(_) => "DURALOG_APPLIER_FAILED",
            EngineError::Spawn { .. } => "DURALOG_THREAD_SPAWN",
            EngineError::Stopped => "DURALOG_ENGINE_STOPPED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Wal(e) => e.severity(),
            EngineError::Overflow(e) => e.severity(),
            EngineError::Applier(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
