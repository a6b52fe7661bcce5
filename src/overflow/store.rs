//! Overflow log store: allocation, garbage accounting and the log state
//! machine.
//!
//! ```text
//!            allocate / recover
//!                   |
//!        +----------+----------+
//!        v                     v
//!    HasSpace  --- full --->  ReadOnly
//!        |                     |
//!        +--- garbage ratio ---+
//!                   v
//!               ToCompact  ---- pass done ---->  Compacted
//!                   |                               |
//!                   +-- all garbage ---------------+|
//!                                                   v
//!                                   DeleteLog ->  ToDelete -> retired
//! ```
//!
//! Every log is in exactly one state. Logs that have not been scanned yet
//! are not registered; retired logs are removed from the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::errors::{OverflowError, OverflowResult};
use super::format::{
    encode_record, Incarnation, LogHeader, RecordHeader, RecordStatus, OVERFLOW_HEADER_LEN,
    OVERFLOW_RECORD_HEADER_LEN,
};
use super::queue::CompactionQueue;
use super::scan::{newest_generation, scan_records, ScannedRecord};
use crate::cache::{BlockCache, BlockKey, FetchMode, LogSpace};
use crate::cancel::CancellationToken;
use crate::codec::{OverflowAddress, RowId, TableId};
use crate::config::EngineConfig;
use crate::crash_point::{maybe_crash, points};
use crate::fileio;
use crate::observability::Metrics;

const OVERFLOW_SUFFIX: &str = ".ovf";
const HEADER_END: u64 = OVERFLOW_HEADER_LEN as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogState {
    HasSpace,
    ReadOnly,
    ToCompact,
    Compacted,
    ToDelete,
}

/// Why a record is being freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeReason {
    /// The owning row dropped or replaced it. Counts as garbage.
    Deleted,
    /// The compactor copied it elsewhere. The whole log is about to go.
    Moved,
}

/// Public view of one log's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    pub log_id: u32,
    pub state: LogState,
    pub end: u64,
    pub garbage: u64,
    pub resume: u64,
    pub exclusive: bool,
    pub pending_refs: u64,
}

/// A live record found while walking a compaction victim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRecord {
    pub addr: OverflowAddress,
    pub table: TableId,
    pub record: RowId,
    pub payload: Vec<u8>,
}

struct LogMeta {
    state: LogState,
    file: Arc<File>,
    /// Times this file has been recycled. Records of earlier lives fail
    /// verification.
    generation: u32,
    end: u64,
    garbage: u64,
    resume: u64,
    exclusive: bool,
    pending_refs: u64,
    /// Key under which the log sits in the has-space index.
    indexed: Option<u64>,
}

impl LogMeta {
    fn empty(file: Arc<File>, generation: u32) -> Self {
        Self {
            state: LogState::HasSpace,
            file,
            generation,
            end: HEADER_END,
            garbage: 0,
            resume: HEADER_END,
            exclusive: false,
            pending_refs: 0,
            indexed: None,
        }
    }

    fn header(&self, log_id: u32) -> LogHeader {
        LogHeader {
            log_id,
            generation: self.generation,
            garbage: self.garbage,
            resume: self.resume,
        }
    }

    fn incarnation(&self, log_id: u32) -> Incarnation {
        Incarnation::new(log_id, self.generation)
    }
}

#[derive(Default)]
struct Registry {
    logs: BTreeMap<u32, LogMeta>,
    /// `(free bytes, log id)` of writable logs nobody holds.
    has_space: BTreeSet<(u64, u32)>,
    /// `(log id, offset)` of records whose status byte is being flipped
    /// outside the lock.
    freeing: BTreeSet<(u32, u64)>,
}

impl Registry {
    /// Re-derive a log's has-space membership from its state and occupancy.
    fn reindex(&mut self, log_id: u32, log_size: u64) {
        let Some(meta) = self.logs.get_mut(&log_id) else {
            return;
        };
        if let Some(free) = meta.indexed.take() {
            self.has_space.remove(&(free, log_id));
        }
        if meta.state != LogState::HasSpace || meta.exclusive {
            return;
        }
        let free = log_size - meta.end;
        if free <= OVERFLOW_RECORD_HEADER_LEN as u64 {
            meta.state = LogState::ReadOnly;
            return;
        }
        self.has_space.insert((free, log_id));
        meta.indexed = Some(free);
    }

    fn set_state(&mut self, log_id: u32, state: LogState, log_size: u64) {
        if let Some(meta) = self.logs.get_mut(&log_id) {
            meta.state = state;
        }
        self.reindex(log_id, log_size);
    }

    fn remove(&mut self, log_id: u32) -> Option<LogMeta> {
        let meta = self.logs.remove(&log_id)?;
        if let Some(free) = meta.indexed {
            self.has_space.remove(&(free, log_id));
        }
        Some(meta)
    }

    fn frees_in_flight(&self, log_id: u32) -> bool {
        self.freeing
            .range((log_id, 0)..=(log_id, u64::MAX))
            .next()
            .is_some()
    }

    fn lowest_free_id(&self, max: u32) -> Option<u32> {
        (1..=max).find(|id| !self.logs.contains_key(id))
    }

    fn highest_free_id(&self, max: u32, except: u32) -> Option<u32> {
        (1..=max)
            .rev()
            .find(|id| *id != except && !self.logs.contains_key(id))
    }
}

pub struct OverflowStore {
    dir: PathBuf,
    log_size: u64,
    max_logs: u32,
    garbage_threshold: f64,
    recycle: bool,
    cache: Arc<BlockCache>,
    queue: Arc<CompactionQueue>,
    registry: Mutex<Registry>,
    drained: Condvar,
    metrics: Arc<Metrics>,
}

impl OverflowStore {
    /// Open the store and recover every overflow log in the directory.
    pub fn open(
        config: &EngineConfig,
        cache: Arc<BlockCache>,
        queue: Arc<CompactionQueue>,
        metrics: Arc<Metrics>,
    ) -> OverflowResult<Self> {
        let dir = config.overflow_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| OverflowError::io(format!("create {}", dir.display()), e))?;

        let store = Self {
            dir,
            log_size: config.overflow_log_size,
            max_logs: config.max_overflow_logs,
            garbage_threshold: config.garbage_ratio_threshold,
            recycle: config.recycle_overflow_logs,
            cache,
            queue,
            registry: Mutex::new(Registry::default()),
            drained: Condvar::new(),
            metrics,
        };
        store.recover()?;
        Ok(store)
    }

    pub fn path_for(&self, log_id: u32) -> PathBuf {
        self.dir.join(format!("{:08}{}", log_id, OVERFLOW_SUFFIX))
    }

    /// Largest payload a single log can hold.
    pub fn max_payload_len(&self) -> u64 {
        self.log_size - HEADER_END - OVERFLOW_RECORD_HEADER_LEN as u64
    }

    pub fn info(&self, log_id: u32) -> Option<LogInfo> {
        let reg = self.registry.lock();
        reg.logs.get(&log_id).map(|m| LogInfo {
            log_id,
            state: m.state,
            end: m.end,
            garbage: m.garbage,
            resume: m.resume,
            exclusive: m.exclusive,
            pending_refs: m.pending_refs,
        })
    }

    pub fn state_of(&self, log_id: u32) -> Option<LogState> {
        self.registry.lock().logs.get(&log_id).map(|m| m.state)
    }

    pub fn log_ids(&self) -> Vec<u32> {
        self.registry.lock().logs.keys().copied().collect()
    }

    pub fn logs_in(&self, state: LogState) -> Vec<u32> {
        self.registry
            .lock()
            .logs
            .iter()
            .filter(|(_, m)| m.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn recover(&self) -> OverflowResult<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| OverflowError::io(format!("list {}", self.dir.display()), e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| OverflowError::io(format!("list {}", self.dir.display()), e))?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_id) {
                if id == 0 || id > self.max_logs {
                    warn!(log_id = id, "ignoring overflow log outside the id space");
                    continue;
                }
                ids.push(id);
            }
        }
        ids.sort_unstable();

        for id in ids {
            self.recover_log(id)?;
        }
        let reg = self.registry.lock();
        info!(
            logs = reg.logs.len(),
            writable = reg.has_space.len(),
            "overflow logs recovered"
        );
        Ok(())
    }

    fn recover_log(&self, log_id: u32) -> OverflowResult<()> {
        let path = self.path_for(log_id);
        let file = open_file(&path)?;
        file.set_len(self.log_size)
            .map_err(|e| OverflowError::io(format!("size {}", path.display()), e))?;

        let mut buf = vec![0u8; self.log_size as usize];
        let n = fileio::read_at(&file, &mut buf, 0)
            .map_err(|e| OverflowError::io(format!("read {}", path.display()), e))?;
        buf.truncate(n);

        let body = buf.get(OVERFLOW_HEADER_LEN..).unwrap_or(&[]);
        let (header, generation) = match LogHeader::decode(&buf) {
            Some(h) if h.log_id == log_id => (Some(h), h.generation),
            Some(h) => {
                // A recycle stopped between the header write and the rename.
                // Nothing in the body belongs to this life.
                warn!(
                    log_id,
                    header_id = h.log_id,
                    "overflow header names another log, starting a new generation"
                );
                (None, h.generation.wrapping_add(1))
            }
            None => {
                let generation = newest_generation(body, log_id).unwrap_or(0);
                warn!(
                    log_id,
                    generation,
                    "overflow header unreadable, generation taken from records"
                );
                (None, generation)
            }
        };
        let outcome = scan_records(body, HEADER_END, Incarnation::new(log_id, generation));

        let mut meta = LogMeta::empty(Arc::new(file), generation);
        meta.end = outcome.end;
        let (header_garbage, resume) = header
            .map(|h| (h.garbage, h.resume))
            .unwrap_or((0, HEADER_END));
        meta.garbage = header_garbage.max(outcome.deleted_bytes) + outcome.skipped_bytes;
        meta.resume = resume.clamp(HEADER_END, meta.end.max(HEADER_END));
        if header.is_none() {
            self.write_header(log_id, &meta)?;
        }

        let compacted = meta.resume == meta.end && meta.end > HEADER_END;
        debug!(
            log_id,
            generation,
            end = meta.end,
            garbage = meta.garbage,
            resume = meta.resume,
            "overflow log scanned"
        );

        let mut reg = self.registry.lock();
        reg.logs.insert(log_id, meta);
        if compacted {
            reg.set_state(log_id, LogState::Compacted, self.log_size);
            self.queue.push(log_id);
        } else {
            reg.reindex(log_id, self.log_size);
            self.reconsider(&mut reg, log_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Hand out a log with at least `min_space` free bytes, allocating one if
    /// none qualifies. The log stays exclusive until the handle is dropped.
    pub fn get_log_for_writing(&self, min_space: u64) -> OverflowResult<OverflowWriteHandle<'_>> {
        let max = self.log_size - HEADER_END;
        if min_space > max {
            return Err(OverflowError::PayloadTooLarge {
                len: min_space,
                max,
            });
        }

        let mut reg = self.registry.lock();
        let picked = reg
            .has_space
            .range((min_space, 0)..)
            .next()
            .map(|(_, id)| *id);
        let log_id = match picked {
            Some(id) => id,
            None => self.allocate_log(&mut reg)?,
        };

        let meta = reg
            .logs
            .get_mut(&log_id)
            .ok_or(OverflowError::NoSuchLog(log_id))?;
        meta.exclusive = true;
        let file = Arc::clone(&meta.file);
        let incarnation = meta.incarnation(log_id);
        reg.reindex(log_id, self.log_size);
        Ok(OverflowWriteHandle {
            store: self,
            incarnation,
            file,
        })
    }

    fn allocate_log(&self, reg: &mut Registry) -> OverflowResult<u32> {
        let log_id = reg
            .lowest_free_id(self.max_logs)
            .ok_or(OverflowError::IdSpaceExhausted { max: self.max_logs })?;

        let path = self.path_for(log_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| OverflowError::io(format!("create {}", path.display()), e))?;
        file.set_len(self.log_size)
            .map_err(|e| OverflowError::io(format!("size {}", path.display()), e))?;
        fileio::write_all_at(&file, &LogHeader::fresh(Incarnation::new(log_id, 0)).encode(), 0)
            .and_then(|_| file.sync_all())
            .map_err(|e| OverflowError::io(format!("write header of {}", path.display()), e))?;
        fileio::sync_dir(&self.dir).map_err(|e| OverflowError::io("sync overflow directory", e))?;

        self.cache.invalidate_log(LogSpace::Overflow, log_id as u64);
        reg.logs.insert(log_id, LogMeta::empty(Arc::new(file), 0));
        self.metrics.overflow_logs_created.incr();
        info!(log_id, "overflow log allocated");
        Ok(log_id)
    }

    fn release(&self, log_id: u32) {
        let mut reg = self.registry.lock();
        if let Some(meta) = reg.logs.get_mut(&log_id) {
            meta.exclusive = false;
        }
        reg.reindex(log_id, self.log_size);
        self.reconsider(&mut reg, log_id);
    }

    /// Push bytes just written at `offset` into the cache. Blocks past the
    /// previous logical end hold nothing older, so they are materialized
    /// blank instead of read.
    fn publish(
        &self,
        file: &File,
        log_id: u32,
        old_end: u64,
        offset: u64,
        bytes: &[u8],
    ) -> OverflowResult<()> {
        let bs = self.cache.block_size() as u64;
        let fresh_from = old_end.div_ceil(bs) * bs;
        let mut scratch = vec![0u8; bs as usize];
        let mut done = 0usize;
        while done < bytes.len() {
            let pos = offset + done as u64;
            let base = pos - pos % bs;
            let within = (pos - base) as usize;
            let n = (bs as usize - within).min(bytes.len() - done);
            let key = BlockKey::new(LogSpace::Overflow, log_id as u64, base);
            if base >= fresh_from {
                self.cache.fetch(file, key, FetchMode::BlankInit, &mut scratch)?;
            }
            self.cache.patch(key, within, &bytes[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn write_header(&self, log_id: u32, meta: &LogMeta) -> OverflowResult<()> {
        let bytes = meta.header(log_id).encode();
        fileio::write_all_at(&meta.file, &bytes, 0)
            .map_err(|e| OverflowError::io(format!("write header of overflow log {}", log_id), e))?;
        self.cache
            .patch(BlockKey::new(LogSpace::Overflow, log_id as u64, 0), 0, &bytes);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn file_of(&self, log_id: u32) -> Option<(Arc<File>, Incarnation)> {
        self.registry
            .lock()
            .logs
            .get(&log_id)
            .map(|m| (Arc::clone(&m.file), m.incarnation(log_id)))
    }

    fn read_range(
        &self,
        file: &File,
        log_id: u32,
        offset: u64,
        out: &mut [u8],
        mode: FetchMode,
    ) -> OverflowResult<()> {
        self.cache
            .read_range(file, LogSpace::Overflow, log_id as u64, offset, out, mode)?;
        Ok(())
    }

    /// Read and verify the payload at `addr`.
    pub fn read(&self, addr: OverflowAddress) -> OverflowResult<Vec<u8>> {
        let (file, incarnation) = self
            .file_of(addr.log_id)
            .ok_or_else(|| OverflowError::bad_address(addr, "log does not exist"))?;
        let total = OVERFLOW_RECORD_HEADER_LEN as u64 + addr.len as u64;
        if addr.offset < HEADER_END || addr.offset + total > self.log_size {
            return Err(OverflowError::bad_address(addr, "outside the log"));
        }

        let mut buf = vec![0u8; total as usize];
        self.read_range(&file, addr.log_id, addr.offset, &mut buf, FetchMode::ReadThrough)?;
        let header = RecordHeader::decode(&buf).ok_or(OverflowError::RecordMismatch { addr })?;
        let payload = buf.split_off(OVERFLOW_RECORD_HEADER_LEN);
        if header.len != addr.len || !header.verify(&payload, incarnation) {
            return Err(OverflowError::RecordMismatch { addr });
        }
        Ok(payload)
    }

    /// Every record with status ok between `from` and the log's end, read
    /// without disturbing the cache.
    pub fn live_records(&self, log_id: u32, from: u64) -> OverflowResult<Vec<LiveRecord>> {
        let (file, end, incarnation) = {
            let reg = self.registry.lock();
            let meta = reg.logs.get(&log_id).ok_or(OverflowError::NoSuchLog(log_id))?;
            (Arc::clone(&meta.file), meta.end, meta.incarnation(log_id))
        };
        if from >= end {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; (end - from) as usize];
        self.read_range(&file, log_id, from, &mut buf, FetchMode::ProbeOnly)?;

        let outcome = scan_records(&buf, from, incarnation);
        Ok(outcome
            .records
            .into_iter()
            .filter(|r| r.header.status == RecordStatus::Ok)
            .map(|ScannedRecord { offset, header }| {
                let start = (offset - from) as usize + OVERFLOW_RECORD_HEADER_LEN;
                LiveRecord {
                    addr: OverflowAddress::new(log_id, offset, header.len),
                    table: header.table,
                    record: header.record,
                    payload: buf[start..start + header.len as usize].to_vec(),
                }
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Freeing
    // ------------------------------------------------------------------

    /// Flip the record at `addr` to deleted. When `owner` is given the record
    /// must belong to that row. Returns false when there was nothing to do:
    /// the log is gone, the record is already deleted or being freed by
    /// someone else, or it is not the expected record.
    ///
    /// The record is read and flipped without the registry lock. The claim in
    /// `freeing` keeps a second free of the same record out and holds off
    /// retirement of the log until the flip has landed.
    pub fn delete_record(
        &self,
        addr: OverflowAddress,
        owner: Option<(TableId, RowId)>,
        reason: FreeReason,
    ) -> OverflowResult<bool> {
        let file = {
            let mut reg = self.registry.lock();
            let Some(meta) = reg.logs.get(&addr.log_id) else {
                return Ok(false);
            };
            let total = OVERFLOW_RECORD_HEADER_LEN as u64 + addr.len as u64;
            if addr.offset < HEADER_END || addr.offset + total > meta.end {
                debug!(?addr, end = meta.end, "freed record lies past the log's end");
                return Ok(false);
            }
            let file = Arc::clone(&meta.file);
            if !reg.freeing.insert((addr.log_id, addr.offset)) {
                return Ok(false);
            }
            file
        };
        let _claim = FreeClaim {
            store: self,
            key: (addr.log_id, addr.offset),
        };

        let mut head = [0u8; OVERFLOW_RECORD_HEADER_LEN];
        self.cache.read_range(
            &file,
            LogSpace::Overflow,
            addr.log_id as u64,
            addr.offset,
            &mut head,
            FetchMode::ProbeOnly,
        )?;
        let header = match RecordHeader::decode(&head) {
            Some(h) if h.len == addr.len && owner.map_or(true, |o| o == (h.table, h.record)) => h,
            _ => {
                warn!(?addr, "overflow record to free does not match, skipping");
                return Ok(false);
            }
        };
        if header.status == RecordStatus::Deleted {
            return Ok(false);
        }

        let status = [RecordStatus::Deleted as u8];
        fileio::write_all_at(&file, &status, addr.offset)
            .map_err(|e| OverflowError::io(format!("free record in overflow log {}", addr.log_id), e))?;
        self.patch_cache(addr.log_id, addr.offset, &status);

        let mut reg = self.registry.lock();
        match reason {
            FreeReason::Deleted => {
                self.metrics.overflow_records_deleted.incr();
                // Retirement waits for the claim, so the log is still here.
                if let Some(meta) = reg.logs.get_mut(&addr.log_id) {
                    meta.garbage += header.total_len();
                    self.write_header(addr.log_id, meta)?;
                }
            }
            FreeReason::Moved => self.metrics.overflow_records_moved.incr(),
        }
        self.reconsider(&mut reg, addr.log_id);
        Ok(true)
    }

    fn patch_cache(&self, log_id: u32, offset: u64, bytes: &[u8]) {
        let bs = self.cache.block_size() as u64;
        let base = offset - offset % bs;
        self.cache.patch(
            BlockKey::new(LogSpace::Overflow, log_id as u64, base),
            (offset - base) as usize,
            bytes,
        );
    }

    /// Move a log toward compaction once its garbage ratio crosses the
    /// threshold.
    fn reconsider(&self, reg: &mut Registry, log_id: u32) {
        let Some(meta) = reg.logs.get_mut(&log_id) else {
            return;
        };
        if !matches!(meta.state, LogState::HasSpace | LogState::ReadOnly) {
            return;
        }
        let used = meta.end - HEADER_END;
        if used == 0 || (meta.garbage as f64) < self.garbage_threshold * used as f64 {
            return;
        }
        if meta.exclusive {
            // Re-checked when the write handle is dropped.
            return;
        }

        let next = if meta.garbage >= used {
            meta.resume = meta.end;
            if let Err(e) = self.write_header(log_id, meta) {
                error!(log_id, error = %e, "failed to persist overflow header");
            }
            LogState::Compacted
        } else {
            LogState::ToCompact
        };
        info!(
            log_id,
            garbage = meta.garbage,
            used,
            state = ?next,
            "overflow log queued for compaction"
        );
        reg.set_state(log_id, next, self.log_size);
        self.queue.push(log_id);
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// An extended payload at `addr` was applied or abandoned.
    pub fn release_ref(&self, addr: OverflowAddress) {
        let mut reg = self.registry.lock();
        if let Some(meta) = reg.logs.get_mut(&addr.log_id) {
            meta.pending_refs = meta.pending_refs.saturating_sub(1);
            if meta.pending_refs == 0 {
                self.drained.notify_all();
            }
        }
    }

    /// Block until no written-but-unapplied payload remains in the log.
    /// Returns false if cancelled first.
    pub fn wait_refs_drained(&self, log_id: u32, cancel: &CancellationToken) -> bool {
        let mut reg = self.registry.lock();
        loop {
            match reg.logs.get(&log_id) {
                Some(meta) if meta.pending_refs > 0 => {}
                _ => return true,
            }
            if cancel.is_cancelled() {
                return false;
            }
            self.drained.wait_for(&mut reg, Duration::from_millis(50));
        }
    }

    // ------------------------------------------------------------------
    // Compaction bookkeeping
    // ------------------------------------------------------------------

    pub fn set_resume(&self, log_id: u32, resume: u64) -> OverflowResult<()> {
        let mut reg = self.registry.lock();
        let meta = reg.logs.get_mut(&log_id).ok_or(OverflowError::NoSuchLog(log_id))?;
        meta.resume = resume;
        self.write_header(log_id, meta)
    }

    /// Every live record has been copied out: reset the garbage count, mark
    /// the pass complete on disk and move to Compacted.
    pub fn finish_pass(&self, log_id: u32) -> OverflowResult<()> {
        let mut reg = self.registry.lock();
        let meta = reg.logs.get_mut(&log_id).ok_or(OverflowError::NoSuchLog(log_id))?;
        meta.garbage = 0;
        meta.resume = meta.end;
        let meta = &*meta;
        self.write_header(log_id, meta)?;
        meta.file
            .sync_data()
            .map_err(|e| OverflowError::io(format!("sync overflow log {}", log_id), e))?;
        reg.set_state(log_id, LogState::Compacted, self.log_size);
        info!(log_id, "overflow log compacted");
        Ok(())
    }

    pub fn mark_to_delete(&self, log_id: u32) {
        let mut reg = self.registry.lock();
        if reg.logs.contains_key(&log_id) {
            reg.set_state(log_id, LogState::ToDelete, self.log_size);
        }
    }

    /// Fsync every overflow log.
    pub fn sync_all(&self) -> OverflowResult<()> {
        let files: Vec<(u32, Arc<File>)> = self
            .registry
            .lock()
            .logs
            .iter()
            .map(|(id, m)| (*id, Arc::clone(&m.file)))
            .collect();
        for (id, file) in files {
            file.sync_data()
                .map_err(|e| OverflowError::io(format!("sync overflow log {}", id), e))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retirement
    // ------------------------------------------------------------------

    /// Retire a compacted log: delete its file, or recycle it under the
    /// highest free id. Logs that still hold live records are left alone, as
    /// are logs that no longer exist. Returns whether the log was retired.
    pub fn delete_log(&self, log_id: u32) -> OverflowResult<bool> {
        let mut reg = self.registry.lock();
        while reg.frees_in_flight(log_id) {
            self.drained.wait(&mut reg);
        }
        match reg.logs.get(&log_id).map(|m| m.state) {
            None => return Ok(false),
            Some(LogState::Compacted | LogState::ToDelete) => {}
            Some(state) => {
                warn!(log_id, ?state, "not retiring an overflow log with live records");
                return Ok(false);
            }
        }
        let Some(meta) = reg.remove(log_id) else {
            return Ok(false);
        };
        self.cache.invalidate_log(LogSpace::Overflow, log_id as u64);
        maybe_crash(points::OVERFLOW_BEFORE_RETIRE);

        let path = self.path_for(log_id);
        let target = if self.recycle {
            reg.highest_free_id(self.max_logs, log_id)
        } else {
            None
        };

        if let Some(new_id) = target {
            // The new header goes in before the rename, so a file found under
            // either name after a crash names a generation newer than every
            // record in it.
            let generation = meta.generation.wrapping_add(1);
            let fresh = LogMeta::empty(meta.file, generation);
            self.cache.invalidate_log(LogSpace::Overflow, new_id as u64);
            self.write_header(new_id, &fresh)?;
            fresh
                .file
                .sync_data()
                .map_err(|e| OverflowError::io(format!("sync {}", path.display()), e))?;

            let new_path = self.path_for(new_id);
            fs::rename(&path, &new_path).map_err(|e| {
                OverflowError::io(format!("recycle {} as {}", path.display(), new_path.display()), e)
            })?;
            fileio::sync_dir(&self.dir)
                .map_err(|e| OverflowError::io("sync overflow directory", e))?;

            reg.logs.insert(new_id, fresh);
            reg.reindex(new_id, self.log_size);
            self.metrics.overflow_logs_recycled.incr();
            info!(from = log_id, to = new_id, generation, "overflow log recycled");
        } else {
            drop(meta);
            fs::remove_file(&path)
                .map_err(|e| OverflowError::io(format!("delete {}", path.display()), e))?;
            fileio::sync_dir(&self.dir)
                .map_err(|e| OverflowError::io("sync overflow directory", e))?;
            self.metrics.overflow_logs_deleted.incr();
            info!(log_id, "overflow log deleted");
        }
        Ok(true)
    }
}

/// Holds a record in `freeing` until its free is done.
struct FreeClaim<'a> {
    store: &'a OverflowStore,
    key: (u32, u64),
}

impl Drop for FreeClaim<'_> {
    fn drop(&mut self) {
        self.store.registry.lock().freeing.remove(&self.key);
        self.store.drained.notify_all();
    }
}

/// Exclusive append access to one overflow log. Dropping it hands the log
/// back to the allocator.
pub struct OverflowWriteHandle<'a> {
    store: &'a OverflowStore,
    incarnation: Incarnation,
    file: Arc<File>,
}

impl OverflowWriteHandle<'_> {
    pub fn log_id(&self) -> u32 {
        self.incarnation.log_id
    }

    /// Append a payload and return its address. The payload counts as a
    /// pending reference until it is applied or released.
    pub fn append(
        &mut self,
        table: TableId,
        record: RowId,
        payload: &[u8],
    ) -> OverflowResult<OverflowAddress> {
        let store = self.store;
        let log_id = self.incarnation.log_id;
        let total = (OVERFLOW_RECORD_HEADER_LEN + payload.len()) as u64;
        let offset = {
            let mut reg = store.registry.lock();
            let meta = reg
                .logs
                .get_mut(&log_id)
                .ok_or(OverflowError::NoSuchLog(log_id))?;
            if meta.end + total > store.log_size {
                return Err(OverflowError::PayloadTooLarge {
                    len: total,
                    max: store.log_size - meta.end,
                });
            }
            let offset = meta.end;
            meta.end += total;
            meta.pending_refs += 1;
            offset
        };

        let bytes = encode_record(self.incarnation, table, record, payload);
        if let Err(e) = fileio::write_all_at(&self.file, &bytes, offset) {
            store.release_ref(OverflowAddress::new(log_id, offset, payload.len() as u32));
            return Err(OverflowError::io(format!("append to overflow log {}", log_id), e));
        }
        maybe_crash(points::OVERFLOW_AFTER_APPEND);
        store.publish(&self.file, log_id, offset, offset, &bytes)?;
        store.metrics.overflow_records_written.incr();
        Ok(OverflowAddress::new(log_id, offset, payload.len() as u32))
    }

    pub fn sync(&self) -> OverflowResult<()> {
        self.file
            .sync_data()
            .map_err(|e| OverflowError::io(format!("sync overflow log {}", self.log_id()), e))
    }
}

impl Drop for OverflowWriteHandle<'_> {
    fn drop(&mut self) {
        self.store.release(self.log_id());
    }
}

fn open_file(path: &Path) -> OverflowResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| OverflowError::io(format!("open {}", path.display()), e))
}

fn parse_id(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(OVERFLOW_SUFFIX)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
