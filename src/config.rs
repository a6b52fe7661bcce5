//! Engine configuration
//!
//! Loaded from a JSON file or built in code. Every field except `data_dir`
//! has a default, so a minimal file is just `{"data_dir": "/var/lib/app"}`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MAX_RECORD_OVERHEAD;
use crate::overflow::{OVERFLOW_HEADER_LEN, OVERFLOW_RECORD_HEADER_LEN};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DURALOG_CONFIG_READ: failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("DURALOG_CONFIG_PARSE: invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("DURALOG_CONFIG_INVALID: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory; WAL files live in `wal/`, overflow logs in `overflow/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Cache block size in bytes. WAL writes are aligned to it.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_cache_blocks")]
    pub cache_blocks: usize,

    #[serde(default = "default_cache_segments")]
    pub cache_segments: usize,

    /// Capacity of each of the two WAL buffers.
    #[serde(default = "default_wal_buffer_size")]
    pub wal_buffer_size: usize,

    /// Size at which a WAL file rolls over. Files are pre-sized to it.
    #[serde(default = "default_wal_log_size")]
    pub wal_log_size: u64,

    /// Issue `fdatasync` on every flush round.
    #[serde(default = "default_true")]
    pub sync_on_commit: bool,

    /// Upper bound on the group-commit delay, in microseconds.
    #[serde(default = "default_max_commit_delay_us")]
    pub max_commit_delay_us: u64,

    /// Largest payload stored inline in a WAL record.
    #[serde(default = "default_inline_payload_limit")]
    pub inline_payload_limit: usize,

    #[serde(default = "default_overflow_log_size")]
    pub overflow_log_size: u64,

    /// Highest usable overflow log id. Running out is fatal.
    #[serde(default = "default_max_overflow_logs")]
    pub max_overflow_logs: u32,

    #[serde(default = "default_garbage_ratio_threshold")]
    pub garbage_ratio_threshold: f64,

    #[serde(default = "default_true")]
    pub recycle_overflow_logs: bool,

    /// Retired WAL files kept around for reuse by the next roll.
    #[serde(default = "default_wal_spare_files")]
    pub wal_spare_files: usize,

    #[serde(default = "default_apply_interval_ms")]
    pub apply_interval_ms: u64,

    /// Fraction of the cache that unapplied WAL bytes may occupy before the
    /// applier is woken early.
    #[serde(default = "default_applier_high_water")]
    pub applier_high_water: f64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_block_size() -> usize {
    4096
}
fn default_cache_blocks() -> usize {
    1024
}
fn default_cache_segments() -> usize {
    16
}
fn default_wal_buffer_size() -> usize {
    256 * 1024
}
fn default_wal_log_size() -> u64 {
    64 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_max_commit_delay_us() -> u64 {
    2000
}
fn default_inline_payload_limit() -> usize {
    2048
}
fn default_overflow_log_size() -> u64 {
    16 * 1024 * 1024
}
fn default_max_overflow_logs() -> u32 {
    4096
}
fn default_garbage_ratio_threshold() -> f64 {
    0.5
}
fn default_wal_spare_files() -> usize {
    2
}
fn default_apply_interval_ms() -> u64 {
    50
}
fn default_applier_high_water() -> f64 {
    0.75
}
fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            block_size: default_block_size(),
            cache_blocks: default_cache_blocks(),
            cache_segments: default_cache_segments(),
            wal_buffer_size: default_wal_buffer_size(),
            wal_log_size: default_wal_log_size(),
            sync_on_commit: true,
            max_commit_delay_us: default_max_commit_delay_us(),
            inline_payload_limit: default_inline_payload_limit(),
            overflow_log_size: default_overflow_log_size(),
            max_overflow_logs: default_max_overflow_logs(),
            garbage_ratio_threshold: default_garbage_ratio_threshold(),
            recycle_overflow_logs: true,
            wal_spare_files: default_wal_spare_files(),
            apply_interval_ms: default_apply_interval_ms(),
            applier_high_water: default_applier_high_water(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(invalid(format!(
                "block_size must be a power of two >= 512, got {}",
                self.block_size
            )));
        }
        if self.cache_blocks < 8 {
            return Err(invalid("cache_blocks must be >= 8"));
        }
        if self.cache_segments == 0 || self.cache_segments > self.cache_blocks {
            return Err(invalid("cache_segments must be in 1..=cache_blocks"));
        }
        if self.inline_payload_limit >= self.block_size {
            return Err(invalid("inline_payload_limit must be smaller than block_size"));
        }
        let min_buffer = self.max_record_len() + 2 * self.block_size;
        if self.wal_buffer_size < min_buffer {
            return Err(invalid(format!(
                "wal_buffer_size must be >= {} for block_size {}",
                min_buffer, self.block_size
            )));
        }
        if self.wal_log_size < self.wal_buffer_size as u64 {
            return Err(invalid("wal_log_size must be >= wal_buffer_size"));
        }
        let min_overflow = (OVERFLOW_HEADER_LEN + OVERFLOW_RECORD_HEADER_LEN) as u64;
        if self.overflow_log_size <= min_overflow {
            return Err(invalid(format!(
                "overflow_log_size must be > {}",
                min_overflow
            )));
        }
        if self.max_overflow_logs < 2 {
            return Err(invalid("max_overflow_logs must be >= 2"));
        }
        if !(self.garbage_ratio_threshold > 0.0 && self.garbage_ratio_threshold <= 1.0) {
            return Err(invalid("garbage_ratio_threshold must be in (0, 1]"));
        }
        if !(self.applier_high_water > 0.0 && self.applier_high_water <= 1.0) {
            return Err(invalid("applier_high_water must be in (0, 1]"));
        }
        if self.apply_interval_ms == 0 {
            return Err(invalid("apply_interval_ms must be >= 1"));
        }
        Ok(())
    }

    /// Largest encoded WAL record the writer accepts.
    pub fn max_record_len(&self) -> usize {
        self.inline_payload_limit + MAX_RECORD_OVERHEAD
    }

    /// Largest payload an overflow log can hold.
    pub fn max_extended_len(&self) -> u64 {
        self.overflow_log_size - (OVERFLOW_HEADER_LEN + OVERFLOW_RECORD_HEADER_LEN) as u64
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn overflow_dir(&self) -> PathBuf {
        self.data_dir.join("overflow")
    }

    pub fn cache_bytes(&self) -> u64 {
        (self.cache_blocks * self.block_size) as u64
    }

    pub fn max_commit_delay(&self) -> Duration {
        Duration::from_micros(self.max_commit_delay_us)
    }

    pub fn apply_interval(&self) -> Duration {
        Duration::from_millis(self.apply_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
