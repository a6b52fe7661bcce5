//! Checkpoint file
//!
//! `wal/checkpoint.json` records the WAL position replay starts from. It is
//! replaced atomically: written to a temp file, synced, renamed over the old
//! one, and the directory synced.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::errors::{WalError, WalResult};
use super::position::LogPosition;
use crate::crash_point::{maybe_crash, points};
use crate::fileio;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_TMP: &str = "checkpoint.json.tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Replay starts here. Every effect before it is durable in the row layer.
    pub position: LogPosition,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(position: LogPosition) -> Self {
        Self {
            position,
            created_at: Utc::now(),
        }
    }

    pub fn path(wal_dir: &Path) -> PathBuf {
        wal_dir.join(CHECKPOINT_FILE)
    }

    /// The stored checkpoint, if one was ever written.
    pub fn load(wal_dir: &Path) -> WalResult<Option<Self>> {
        let path = Self::path(wal_dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WalError::io(format!("read {}", path.display()), e)),
        };
        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            WalError::corruption(LogPosition::default(), format!("checkpoint file: {}", e))
        })?;
        Ok(Some(checkpoint))
    }

    pub fn store(&self, wal_dir: &Path) -> WalResult<()> {
        let tmp = wal_dir.join(CHECKPOINT_TMP);
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            WalError::io("encode checkpoint", std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut file =
            File::create(&tmp).map_err(|e| WalError::io(format!("create {}", tmp.display()), e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| WalError::io(format!("write {}", tmp.display()), e))?;
        drop(file);

        maybe_crash(points::CHECKPOINT_BEFORE_RENAME);
        let path = Self::path(wal_dir);
        fs::rename(&tmp, &path)
            .map_err(|e| WalError::io(format!("rename {}", path.display()), e))?;
        fileio::sync_dir(wal_dir).map_err(|e| WalError::io("sync WAL directory", e))?;

        info!(position = %self.position, "checkpoint stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Checkpoint::load(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_store_replaces_previous() {
        let dir = TempDir::new().unwrap();
        Checkpoint::new(LogPosition::new(1, 100)).store(dir.path()).unwrap();
        Checkpoint::new(LogPosition::new(3, 40)).store(dir.path()).unwrap();

        let loaded = Checkpoint::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.position, LogPosition::new(3, 40));
        assert!(!dir.path().join(CHECKPOINT_TMP).exists());
    }

    #[test]
    fn test_garbled_checkpoint_is_corruption() {
        let dir = TempDir::new().unwrap();
        fs::write(Checkpoint::path(dir.path()), "{\"position\":").unwrap();
        let err = Checkpoint::load(dir.path()).unwrap_err();
        assert!(err.is_fatal());
    }
}
