//! WAL file registry: naming, pre-sizing, spare reuse and cached reads.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::errors::{WalError, WalResult};
use super::reader::LogSource;
use crate::cache::{BlockCache, BlockKey, FetchMode, LogSpace};
use crate::fileio;
use crate::observability::Metrics;

const WAL_SUFFIX: &str = ".wal";
const SPARE_PREFIX: &str = "spare-";

/// A retired file waiting to be renamed into a new log id.
#[derive(Debug, Clone)]
struct Spare {
    old_id: u64,
    path: PathBuf,
}

pub struct WalFiles {
    dir: PathBuf,
    log_size: u64,
    max_spares: usize,
    cache: Arc<BlockCache>,
    handles: Mutex<BTreeMap<u64, Arc<File>>>,
    spares: Mutex<Vec<Spare>>,
    metrics: Arc<Metrics>,
}

impl WalFiles {
    pub fn open(
        dir: impl AsRef<Path>,
        log_size: u64,
        max_spares: usize,
        cache: Arc<BlockCache>,
        metrics: Arc<Metrics>,
    ) -> WalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| WalError::io(format!("create WAL directory {}", dir.display()), e))?;

        let mut spares = Vec::new();
        for entry in read_dir(&dir)? {
            if let Some(old_id) = parse_id(&entry, SPARE_PREFIX) {
                spares.push(Spare {
                    old_id,
                    path: dir.join(&entry),
                });
            }
        }

        Ok(Self {
            dir,
            log_size,
            max_spares,
            cache,
            handles: Mutex::new(BTreeMap::new()),
            spares: Mutex::new(spares),
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_size(&self) -> u64 {
        self.log_size
    }

    pub fn path_for(&self, log_id: u64) -> PathBuf {
        self.dir.join(format!("{:010}{}", log_id, WAL_SUFFIX))
    }

    /// Ids of every WAL file on disk, ascending.
    pub fn list_logs(&self) -> WalResult<Vec<u64>> {
        let mut ids: Vec<u64> = read_dir(&self.dir)?
            .iter()
            .filter_map(|name| parse_id(name, ""))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn exists(&self, log_id: u64) -> bool {
        self.handles.lock().contains_key(&log_id) || self.path_for(log_id).exists()
    }

    pub fn spare_count(&self) -> usize {
        self.spares.lock().len()
    }

    /// Handle to an existing log file.
    pub fn file(&self, log_id: u64) -> WalResult<Arc<File>> {
        let mut handles = self.handles.lock();
        if let Some(file) = handles.get(&log_id) {
            return Ok(Arc::clone(file));
        }
        let path = self.path_for(log_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| WalError::io(format!("open WAL file {}", path.display()), e))?;
        let file = Arc::new(file);
        handles.insert(log_id, Arc::clone(&file));
        Ok(file)
    }

    /// Create the file for a new log id, pre-sized to the roll threshold.
    ///
    /// A spare is reused when its old id cannot alias the new one under the
    /// one-byte record checksum.
    pub fn create(&self, log_id: u64) -> WalResult<Arc<File>> {
        let path = self.path_for(log_id);
        let spare = {
            let mut spares = self.spares.lock();
            spares
                .iter()
                .position(|s| (log_id.wrapping_sub(s.old_id)) % 256 != 0)
                .map(|i| spares.swap_remove(i))
        };

        if let Some(spare) = spare {
            fs::rename(&spare.path, &path).map_err(|e| {
                WalError::io(format!("reuse spare {} as log {}", spare.path.display(), log_id), e)
            })?;
            self.metrics.wal_files_reused.incr();
            debug!(log_id, old_id = spare.old_id, "reused spare WAL file");
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| WalError::io(format!("create WAL file {}", path.display()), e))?;
        file.set_len(self.log_size)
            .map_err(|e| WalError::io(format!("pre-size WAL file {}", path.display()), e))?;
        fileio::sync_dir(&self.dir).map_err(|e| WalError::io("sync WAL directory", e))?;

        let file = Arc::new(file);
        self.handles.lock().insert(log_id, Arc::clone(&file));
        Ok(file)
    }

    /// Read through the block cache. Space past the end of the file reads as
    /// zeros.
    pub fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
        let file = self.file(log_id)?;
        self.cache.read_range(
            &file,
            LogSpace::Wal,
            log_id,
            offset,
            out,
            FetchMode::ReadThrough,
        )?;
        Ok(())
    }

    /// Push bytes just written at block-aligned `base` into the cache.
    pub fn publish(&self, log_id: u64, base: u64, bytes: &[u8]) {
        let bs = self.cache.block_size();
        debug_assert_eq!(base % bs as u64, 0);
        for (i, chunk) in bytes.chunks(bs).enumerate() {
            let key = BlockKey::new(LogSpace::Wal, log_id, base + (i * bs) as u64);
            self.cache.put(key, chunk);
        }
    }

    /// Delete a log that replay did not reach.
    pub fn discard(&self, log_id: u64) -> WalResult<()> {
        self.handles.lock().remove(&log_id);
        self.cache.invalidate_log(LogSpace::Wal, log_id);
        let path = self.path_for(log_id);
        fs::remove_file(&path)
            .map_err(|e| WalError::io(format!("discard WAL file {}", path.display()), e))?;
        fileio::sync_dir(&self.dir).map_err(|e| WalError::io("sync WAL directory", e))?;
        info!(log_id, "discarded unreachable WAL file");
        Ok(())
    }

    /// Retire every log older than `log_id`. Up to `max_spares` files are kept
    /// for reuse, the rest are deleted. Returns how many logs were retired.
    pub fn retire_before(&self, log_id: u64) -> WalResult<usize> {
        let old: Vec<u64> = self
            .list_logs()?
            .into_iter()
            .filter(|id| *id < log_id)
            .collect();

        for id in &old {
            self.handles.lock().remove(id);
            self.cache.invalidate_log(LogSpace::Wal, *id);
            let path = self.path_for(*id);

            let mut spares = self.spares.lock();
            if spares.len() < self.max_spares {
                let spare_path = self.dir.join(format!("{}{:010}{}", SPARE_PREFIX, id, WAL_SUFFIX));
                fs::rename(&path, &spare_path)
                    .map_err(|e| WalError::io(format!("retire WAL file {}", path.display()), e))?;
                spares.push(Spare {
                    old_id: *id,
                    path: spare_path,
                });
            } else {
                fs::remove_file(&path)
                    .map_err(|e| WalError::io(format!("delete WAL file {}", path.display()), e))?;
            }
        }
        if !old.is_empty() {
            fileio::sync_dir(&self.dir).map_err(|e| WalError::io("sync WAL directory", e))?;
            info!(retired = old.len(), before = log_id, "retired WAL files");
        }
        Ok(old.len())
    }
}

impl LogSource for WalFiles {
    fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
        WalFiles::read_at(self, log_id, offset, out)
    }

    fn log_exists(&self, log_id: u64) -> bool {
        self.exists(log_id)
    }

    fn log_size(&self) -> u64 {
        self.log_size
    }
}

fn read_dir(dir: &Path) -> WalResult<Vec<String>> {
    let entries =
        fs::read_dir(dir).map_err(|e| WalError::io(format!("list {}", dir.display()), e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| WalError::io(format!("list {}", dir.display()), e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Parse `<prefix><digits>.wal`.
fn parse_id(name: &str, prefix: &str) -> Option<u64> {
    let stem = name.strip_prefix(prefix)?.strip_suffix(WAL_SUFFIX)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files(dir: &TempDir, spares: usize) -> WalFiles {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(512, 16, 2, Arc::clone(&metrics)));
        WalFiles::open(dir.path().join("wal"), 8192, spares, cache, metrics).unwrap()
    }

    #[test]
    fn test_create_presizes_and_lists() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir, 0);
        files.create(2).unwrap();
        files.create(1).unwrap();

        assert_eq!(files.list_logs().unwrap(), vec![1, 2]);
        let len = fs::metadata(files.path_for(1)).unwrap().len();
        assert_eq!(len, 8192);
    }

    #[test]
    fn test_publish_then_read_hits_cache() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir, 0);
        files.create(1).unwrap();
        files.publish(1, 512, b"cached");

        let mut out = [0u8; 6];
        files.read_at(1, 512, &mut out).unwrap();
        assert_eq!(&out, b"cached");
    }

    #[test]
    fn test_retire_keeps_spares_and_reuses_them() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir, 1);
        for id in 1..=3 {
            files.create(id).unwrap();
        }
        assert_eq!(files.retire_before(3).unwrap(), 2);
        assert_eq!(files.list_logs().unwrap(), vec![3]);
        assert_eq!(files.spare_count(), 1);

        files.create(4).unwrap();
        assert_eq!(files.spare_count(), 0);
        assert_eq!(files.metrics.wal_files_reused.get(), 1);
        assert_eq!(files.list_logs().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_spare_is_not_reused_for_aliasing_id() {
        let dir = TempDir::new().unwrap();
        let files = files(&dir, 1);
        files.create(1).unwrap();
        files.retire_before(2).unwrap();

        files.create(257).unwrap();
        assert_eq!(files.spare_count(), 1, "id 257 aliases id 1 modulo 256");
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("0000000007.wal", ""), Some(7));
        assert_eq!(parse_id("spare-0000000007.wal", SPARE_PREFIX), Some(7));
        assert_eq!(parse_id("spare-0000000007.wal", ""), None);
        assert_eq!(parse_id("checkpoint.json", ""), None);
    }
}
