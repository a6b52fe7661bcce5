//! Double-buffered WAL writer with group commit
//!
//! Appenders copy encoded records into the Append buffer under a short lock.
//! Whoever needs durability contends for the writer role; the winner swaps
//! the Append and Write buffers, writes the Write buffer at its block-aligned
//! base, syncs, publishes the blocks into the cache and advances the flush
//! frontier. Everyone else waits on the frontier, so concurrent commits share
//! one write and one sync.
//!
//! A failed round poisons the writer: the error goes to every waiter and to
//! every later caller. The Append buffer is never the buffer being written,
//! so a failure cannot leave half-copied records behind.

use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info};

use super::buffer::{align_down, LogBuffer};
use super::errors::{WalError, WalResult};
use super::files::WalFiles;
use super::position::LogPosition;
use super::reader::LogSource;
use crate::codec::{decode, CodecError, Decoded, LogRecord};
use crate::config::EngineConfig;
use crate::crash_point::{maybe_crash, points};
use crate::fileio;
use crate::observability::Metrics;

/// Encoded size of a NewLog record. Room for one is always kept free so a
/// full buffer or file can still be closed off.
const NEWLOG_LEN: usize = 11;

/// Told about every frontier advance, outside the writer's locks.
pub trait FlushObserver: Send + Sync {
    fn flushed(&self, frontier: LogPosition);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Idle,
    Writing,
}

struct WriterState {
    role: Role,
    frontier: LogPosition,
    failure: Option<String>,
}

/// Decrements the in-flight count when a waiting caller leaves.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WalWriter {
    files: Arc<WalFiles>,
    append: Mutex<LogBuffer>,
    write: RwLock<LogBuffer>,
    state: Mutex<WriterState>,
    cond: Condvar,
    current_log: AtomicU64,
    poisoned: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    last_flush_nanos: AtomicU64,
    observer: RwLock<Option<Arc<dyn FlushObserver>>>,
    block_size: usize,
    max_record_len: usize,
    sync_on_commit: bool,
    max_commit_delay: Duration,
    metrics: Arc<Metrics>,
}

impl WalWriter {
    /// Start a fresh log after `recovered_end`, the position where strict
    /// replay stopped. Logs past it hold nothing replay accepted and are
    /// discarded. The new log's Header links back to `recovered_end`, so the
    /// torn tail of the previous log is never appended to.
    pub fn open(
        config: &EngineConfig,
        files: Arc<WalFiles>,
        recovered_end: Option<LogPosition>,
        metrics: Arc<Metrics>,
    ) -> WalResult<Self> {
        let existing = files.list_logs()?;
        let (log_id, prev) = match recovered_end {
            Some(end) => {
                for stale in existing.iter().filter(|id| **id > end.log_id) {
                    files.discard(*stale)?;
                }
                (end.log_id + 1, end)
            }
            None => {
                let last = existing.last().copied().unwrap_or(0);
                (last + 1, LogPosition::new(last, 0))
            }
        };

        files.create(log_id)?;
        let mut append = LogBuffer::new(log_id, 0, config.wal_buffer_size);
        LogRecord::Header {
            log_id,
            prev_log_id: prev.log_id,
            prev_end: prev.offset,
        }
        .encode_into(&mut append.data, log_id)?;

        let writer = Self {
            files,
            append: Mutex::new(append),
            write: RwLock::new(LogBuffer::new(log_id, 0, config.wal_buffer_size)),
            state: Mutex::new(WriterState {
                role: Role::Idle,
                frontier: LogPosition::new(log_id, 0),
                failure: None,
            }),
            cond: Condvar::new(),
            current_log: AtomicU64::new(log_id),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            last_flush_nanos: AtomicU64::new(config.max_commit_delay().as_nanos() as u64),
            observer: RwLock::new(None),
            block_size: config.block_size,
            max_record_len: config.max_record_len(),
            sync_on_commit: config.sync_on_commit,
            max_commit_delay: config.max_commit_delay(),
            metrics,
        };
        writer.flush()?;
        info!(log_id, prev = %prev, "WAL writer opened");
        Ok(writer)
    }

    pub fn set_observer(&self, observer: Arc<dyn FlushObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn files(&self) -> &Arc<WalFiles> {
        &self.files
    }

    /// Everything before this position is durable.
    pub fn frontier(&self) -> LogPosition {
        self.state.lock().frontier
    }

    /// Position the next appended record will get.
    pub fn append_position(&self) -> LogPosition {
        self.append.lock().position()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Append a record and return its start position. With `commit`, returns
    /// only once the record is durable.
    pub fn append(&self, record: &LogRecord, commit: bool) -> WalResult<LogPosition> {
        self.check_open()?;
        let len = record.encoded_len();
        if len > self.max_record_len {
            return Err(WalError::RecordTooLarge {
                len,
                max: self.max_record_len,
            });
        }
        let _waiting = commit.then(|| InFlight::enter(&self.in_flight));

        loop {
            let mut buf = self.append.lock();
            let fits_buffer = buf.data.len() + len + NEWLOG_LEN <= buf.capacity;
            let fits_file = buf.end() + (len + NEWLOG_LEN) as u64 <= self.files.log_size();
            if fits_buffer && fits_file {
                let start = buf.position();
                let log_id = buf.log_id;
                record.encode_into(&mut buf.data, log_id)?;
                let end = buf.position();
                drop(buf);
                self.metrics.wal_records_appended.incr();
                if commit {
                    self.drive(end, None)?;
                }
                return Ok(start);
            }

            let target = buf.position();
            let roll = (!fits_file).then_some(buf.log_id);
            drop(buf);
            self.drive(target, roll)?;
        }
    }

    /// Make every record appended so far durable.
    pub fn flush(&self) -> WalResult<LogPosition> {
        self.check_open()?;
        let _waiting = InFlight::enter(&self.in_flight);
        let target = self.append_position();
        self.drive(target, None)?;
        Ok(target)
    }

    /// Flush and refuse further appends.
    pub fn close(&self) -> WalResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.flush().map(|_| ());
        self.closed.store(true, Ordering::SeqCst);
        info!(frontier = %self.frontier(), "WAL writer closed");
        result
    }

    fn check_open(&self) -> WalResult<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            let reason = self.state.lock().failure.clone().unwrap_or_default();
            return Err(WalError::FlushFailed(reason));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    /// Wait until the frontier reaches `target`, taking the writer role when
    /// nobody holds it. `roll_if_log` forces the log to roll if it is still
    /// the current one.
    fn drive(&self, target: LogPosition, roll_if_log: Option<u64>) -> WalResult<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.failure {
                return Err(WalError::FlushFailed(reason.clone()));
            }
            let roll = roll_if_log.filter(|id| *id == self.current_log.load(Ordering::SeqCst));
            if state.frontier >= target && roll.is_none() {
                return Ok(());
            }

            if state.role == Role::Writing {
                self.cond.wait(&mut state);
                continue;
            }

            state.role = Role::Writing;
            let result = MutexGuard::unlocked(&mut state, || self.write_round(roll));
            state.role = Role::Idle;
            match result {
                Ok(frontier) => {
                    if frontier > state.frontier {
                        state.frontier = frontier;
                    }
                    self.cond.notify_all();
                    let frontier = state.frontier;
                    MutexGuard::unlocked(&mut state, || self.notify_observer(frontier));
                }
                Err(err) => {
                    error!(error = %err, code = err.code(), "WAL flush failed, writer poisoned");
                    let reason = err.to_string();
                    state.failure = Some(reason.clone());
                    self.poisoned.store(true, Ordering::SeqCst);
                    self.cond.notify_all();
                    return Err(WalError::FlushFailed(reason));
                }
            }
        }
    }

    fn notify_observer(&self, frontier: LogPosition) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.flushed(frontier);
        }
    }

    fn commit_delay(&self) -> Duration {
        if self.in_flight.load(Ordering::SeqCst) <= 1 {
            return Duration::ZERO;
        }
        let last = Duration::from_nanos(self.last_flush_nanos.load(Ordering::Relaxed));
        last.min(self.max_commit_delay)
    }

    /// One flush round. Only the holder of the writer role calls this.
    fn write_round(&self, force_roll: Option<u64>) -> WalResult<LogPosition> {
        let delay = self.commit_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let started = Instant::now();

        let mut write = self.write.write();
        let rolled_to = self.swap_buffers(&mut write, force_roll)?;
        let write = RwLockWriteGuard::downgrade(write);

        if let Some(next) = rolled_to {
            self.files.create(next)?;
            self.metrics.wal_rolls.incr();
            maybe_crash(points::WAL_AFTER_ROLL);
            debug!(from = write.log_id, to = next, "WAL rolled over");
        }

        let file = self.files.file(write.log_id)?;
        self.write_out(&file, &write)?;
        self.files.publish(write.log_id, write.base, &write.data);

        self.metrics.wal_flushes.incr();
        self.metrics.wal_bytes_written.add(write.data.len() as u64);
        self.last_flush_nanos
            .store(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(write.position())
    }

    /// Move the Append buffer's records into the Write buffer. Returns the
    /// new log id when the log rolls.
    fn swap_buffers(
        &self,
        write: &mut LogBuffer,
        force_roll: Option<u64>,
    ) -> WalResult<Option<u64>> {
        let mut append = self.append.lock();
        std::mem::swap(write, &mut *append);

        let log_id = write.log_id;
        let tail = write.end() + (self.max_record_len + NEWLOG_LEN) as u64;
        if force_roll == Some(log_id) || tail > self.files.log_size() {
            let next = log_id + 1;
            LogRecord::NewLog { next_log_id: next }.encode_into(&mut write.data, log_id)?;
            append.reset(next, 0);
            LogRecord::Header {
                log_id: next,
                prev_log_id: log_id,
                prev_end: write.end(),
            }
            .encode_into(&mut append.data, next)?;
            self.current_log.store(next, Ordering::SeqCst);
            return Ok(Some(next));
        }

        // Carry the partial last block so the next write starts aligned.
        let base = align_down(write.end(), self.block_size);
        append.reset(log_id, base);
        let from = (base - write.base) as usize;
        append.data.extend_from_slice(&write.data[from..]);
        Ok(None)
    }

    fn write_out(&self, file: &File, buf: &LogBuffer) -> WalResult<()> {
        maybe_crash(points::WAL_BEFORE_WRITE);
        fileio::write_all_at(file, &buf.data, buf.base).map_err(|e| {
            WalError::io(format!("write WAL log {} at {}", buf.log_id, buf.base), e)
        })?;
        maybe_crash(points::WAL_AFTER_WRITE);
        if self.sync_on_commit {
            file.sync_data()
                .map_err(|e| WalError::io(format!("sync WAL log {}", buf.log_id), e))?;
            self.metrics.wal_syncs.incr();
        }
        maybe_crash(points::WAL_AFTER_SYNC);
        Ok(())
    }

    /// Random read: Write buffer, then Append buffer, then cache and file.
    pub fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
        // Holding the Write buffer read lock keeps both buffers from being
        // swapped until the bytes are copied.
        let write = self.write.read();
        let mut covered = write.overlay(log_id, offset, out);
        covered = covered.min(self.append.lock().overlay(log_id, offset, out));
        if covered > 0 {
            self.files.read_at(log_id, offset, &mut out[..covered])?;
        }
        Ok(())
    }

    /// Decode the record at `pos`.
    pub fn read_record(&self, pos: LogPosition) -> WalResult<LogRecord> {
        let room = self.files.log_size().saturating_sub(pos.offset) as usize;
        let mut len = room.min(64);
        loop {
            let mut buf = vec![0u8; len];
            self.read_at(pos.log_id, pos.offset, &mut buf)?;
            match decode(&buf, pos.log_id) {
                Ok(Decoded::Record { record, .. }) => return Ok(record),
                Ok(Decoded::Unwritten) => {
                    return Err(WalError::corruption(pos, "no record at this position"))
                }
                Err(CodecError::Incomplete { needed, .. }) if needed <= room => {
                    len = needed;
                }
                Err(e) => return Err(WalError::corruption(pos, e.to_string())),
            }
        }
    }
}

impl LogSource for WalWriter {
    fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
        WalWriter::read_at(self, log_id, offset, out)
    }

    fn log_exists(&self, log_id: u64) -> bool {
        self.files.exists(log_id)
    }

    fn log_size(&self) -> u64 {
        self.files.log_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::codec::{Payload, RowChange};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::new(dir.path());
        config.block_size = 512;
        config.cache_blocks = 64;
        config.cache_segments = 4;
        config.inline_payload_limit = 256;
        config.wal_buffer_size = 2048;
        config.wal_log_size = 4096;
        config.max_commit_delay_us = 200;
        config
    }

    fn open(config: &EngineConfig, end: Option<LogPosition>) -> WalWriter {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(config.block_size, config.cache_blocks, 4, Arc::clone(&metrics)));
        let files = Arc::new(
            WalFiles::open(config.wal_dir(), config.wal_log_size, 0, cache, Arc::clone(&metrics)).unwrap(),
        );
        WalWriter::open(config, files, end, metrics).unwrap()
    }

    fn insert(seq: u64, bytes: usize) -> LogRecord {
        LogRecord::Insert(RowChange::new(0, seq, 1, seq, Payload::Inline(vec![seq as u8; bytes])))
    }

    #[test]
    fn test_open_writes_linked_header() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = open(&config, Some(LogPosition::new(4, 120)));

        assert_eq!(writer.frontier().log_id, 5);
        match writer.read_record(LogPosition::new(5, 0)).unwrap() {
            LogRecord::Header { log_id, prev_log_id, prev_end } => {
                assert_eq!((log_id, prev_log_id, prev_end), (5, 4, 120));
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_commit_advances_frontier_past_record() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = open(&config, None);

        let record = insert(1, 10);
        let pos = writer.append(&record, true).unwrap();
        let end = LogPosition::new(pos.log_id, pos.offset + record.encoded_len() as u64);
        assert!(writer.frontier() >= end);
        assert_eq!(writer.read_record(pos).unwrap(), record);
    }

    #[test]
    fn test_uncommitted_append_is_readable_before_flush() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = open(&config, None);

        let before = writer.frontier();
        let record = insert(7, 40);
        let pos = writer.append(&record, false).unwrap();
        assert_eq!(writer.frontier(), before, "no I/O without commit");
        assert_eq!(writer.read_record(pos).unwrap(), record);
    }

    #[test]
    fn test_roll_links_new_log() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = open(&config, None);

        let mut last = LogPosition::default();
        for seq in 0..60 {
            last = writer.append(&insert(seq, 200), seq % 5 == 0).unwrap();
        }
        writer.flush().unwrap();
        assert!(last.log_id > 1, "log should have rolled");
        assert!(writer.metrics.wal_rolls.get() >= 1);
        match writer.read_record(LogPosition::new(2, 0)).unwrap() {
            LogRecord::Header { prev_log_id, .. } => assert_eq!(prev_log_id, 1),
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = open(&config, None);
        let err = writer.append(&insert(1, 1000), true).unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge { .. }));
    }

    #[test]
    fn test_close_refuses_appends() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = open(&config, None);
        writer.close().unwrap();
        assert!(matches!(writer.append(&insert(1, 1), false), Err(WalError::Closed)));
    }

    #[test]
    fn test_concurrent_commits_share_flushes() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.wal_log_size = 1 << 20;
        config.wal_buffer_size = 1 << 16;
        let writer = Arc::new(open(&config, None));
        let flushes_before = writer.metrics.wal_flushes.get();

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for i in 0..20 {
                        writer.append(&insert(t * 100 + i, 16), true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let flushes = writer.metrics.wal_flushes.get() - flushes_before;
        assert!(flushes <= 160, "at most one flush per commit, got {}", flushes);
        assert_eq!(writer.frontier(), writer.append_position());
    }

    #[test]
    fn test_failed_round_poisons_every_committer() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let writer = Arc::new(open(&config, None));
        // Log 2 cannot be created, so the first round that rolls fails.
        std::fs::create_dir(writer.files().path_for(2)).unwrap();
        let durable = writer.frontier();

        let start = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let writer = Arc::clone(&writer);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for i in 0..100 {
                        if let Err(e) = writer.append(&insert(t * 1000 + i, 200), true) {
                            return e;
                        }
                    }
                    panic!("committer {} never saw the failed flush", t);
                })
            })
            .collect();
        for h in handles {
            match h.join().unwrap() {
                WalError::FlushFailed(reason) => {
                    assert!(reason.contains("create WAL file"), "unexpected reason: {}", reason)
                }
                other => panic!("expected FlushFailed, got {:?}", other),
            }
        }

        assert!(writer.is_poisoned());
        assert_eq!(writer.frontier().log_id, durable.log_id, "nothing reached log 2");
        assert!(matches!(
            writer.append(&insert(9999, 1), false),
            Err(WalError::FlushFailed(_))
        ));
        assert!(matches!(writer.flush(), Err(WalError::FlushFailed(_))));
        assert!(matches!(writer.close(), Err(WalError::FlushFailed(_))));
    }
}
