use std::io;

use thiserror::Error;

use super::LogSpace;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("DURALOG_CACHE_READ: failed to read {space:?} log {log_id} block at {address}: {source}")]
    Read {
        space: LogSpace,
        log_id: u64,
        address: u64,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::Read { .. } => "DURALOG_CACHE_READ",
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
