use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use super::errors::{EngineError, EngineResult};
use crate::applier::{Applier, Dispatcher};
use crate::cache::BlockCache;
use crate::codec::{LogRecord, OverflowAddress, RowId, TableId};
use crate::compactor::{Compactor, CompactorDeps, Watermarks};
use crate::config::EngineConfig;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::overflow::{CompactionQueue, FreeReason, OverflowStore, OVERFLOW_RECORD_HEADER_LEN};
use crate::recovery::{ReplayStats, WalReplayer};
use crate::rows::{RowStore, TableLocks};
use crate::wal::{Checkpoint, LogPosition, OpSequence, WalFiles, WalWriter};

/// The storage engine: owns the cache, both logs and the background threads.
///
/// Nothing is global. Everything lives from `open` until `shutdown` (or drop,
/// which stops the threads without writing an end marker).
pub struct Engine {
    config: EngineConfig,
    metrics: Arc<Metrics>,
    cache: Arc<BlockCache>,
    writer: Arc<WalWriter>,
    overflow: Arc<OverflowStore>,
    queue: Arc<CompactionQueue>,
    rows: Arc<dyn RowStore>,
    sequence: Arc<OpSequence>,
    applier: Applier,
    compactor: Compactor,
    replay: ReplayStats,
    stopped: AtomicBool,
}

impl Engine {
    /// Recover from `config.data_dir` and start the background threads.
    pub fn open(config: EngineConfig, rows: Arc<dyn RowStore>) -> EngineResult<Self> {
        config.validate()?;
        info!(data_dir = %config.data_dir.display(), "opening engine");

        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(
            config.block_size,
            config.cache_blocks,
            config.cache_segments,
            Arc::clone(&metrics),
        ));
        let queue = Arc::new(CompactionQueue::new());
        let overflow = Arc::new(OverflowStore::open(
            &config,
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&metrics),
        )?);
        let files = Arc::new(WalFiles::open(
            config.wal_dir(),
            config.wal_log_size,
            config.wal_spare_files,
            Arc::clone(&cache),
            Arc::clone(&metrics),
        )?);
        let locks = Arc::new(TableLocks::new());
        let watermarks = Arc::new(Watermarks::new());

        let checkpoint = Checkpoint::load(&config.wal_dir())?;
        let mut dispatcher = Dispatcher::for_replay(
            Arc::clone(&rows),
            Arc::clone(&locks),
            Arc::clone(&overflow),
            Arc::clone(&watermarks),
            Arc::clone(&metrics),
        );
        let replay = WalReplayer::replay(
            &files,
            checkpoint.map(|c| c.position),
            &mut dispatcher,
            config.max_record_len(),
        )?;

        let writer = Arc::new(WalWriter::open(
            &config,
            files,
            replay.end,
            Arc::clone(&metrics),
        )?);
        let sequence = Arc::new(OpSequence::new(replay.max_seq));

        let start = LogPosition::new(writer.frontier().log_id, 0);
        let applier = Applier::spawn(
            &config,
            Arc::clone(&writer),
            Dispatcher::new(
                Arc::clone(&rows),
                Arc::clone(&locks),
                Arc::clone(&overflow),
                Arc::clone(&watermarks),
                Arc::clone(&metrics),
            ),
            start,
        )?;
        let compactor = Compactor::spawn(
            &config,
            CompactorDeps {
                overflow: Arc::clone(&overflow),
                queue: Arc::clone(&queue),
                writer: Arc::clone(&writer),
                rows: Arc::clone(&rows),
                locks,
                watermarks,
                sequence: Arc::clone(&sequence),
                metrics: Arc::clone(&metrics),
            },
        )?;

        info!(
            wal = %start,
            overflow_logs = overflow.log_ids().len(),
            queued_for_compaction = queue.len(),
            "engine open"
        );
        Ok(Self {
            config,
            metrics,
            cache,
            writer,
            overflow,
            queue,
            rows,
            sequence,
            applier,
            compactor,
            replay,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What startup replay did.
    pub fn replay_stats(&self) -> &ReplayStats {
        &self.replay
    }

    pub fn overflow(&self) -> &Arc<OverflowStore> {
        &self.overflow
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Append a record. With `commit`, returns once it is durable.
    pub fn append(&self, record: &LogRecord, commit: bool) -> EngineResult<LogPosition> {
        self.check_running()?;
        Ok(self.writer.append(record, commit)?)
    }

    /// Make every appended record durable.
    pub fn flush(&self) -> EngineResult<LogPosition> {
        self.check_running()?;
        Ok(self.writer.flush()?)
    }

    /// Everything before this position is durable.
    pub fn frontier(&self) -> LogPosition {
        self.writer.frontier()
    }

    /// Everything before this position has been applied.
    pub fn applied(&self) -> LogPosition {
        self.applier.applied()
    }

    pub fn next_op_seq(&self) -> u64 {
        self.sequence.next()
    }

    /// Store a payload in an overflow log and return its address. The bytes
    /// are durable on return; reference the address from a WAL record, or
    /// give it back with `release_extended`.
    pub fn write_extended(
        &self,
        table: TableId,
        record: RowId,
        bytes: &[u8],
    ) -> EngineResult<OverflowAddress> {
        self.check_running()?;
        let total = (OVERFLOW_RECORD_HEADER_LEN + bytes.len()) as u64;
        let mut handle = self.overflow.get_log_for_writing(total)?;
        let addr = handle.append(table, record, bytes)?;
        handle.sync()?;
        Ok(addr)
    }

    pub fn read_extended(&self, addr: OverflowAddress) -> EngineResult<Vec<u8>> {
        Ok(self.overflow.read(addr)?)
    }

    /// Give back a payload that no WAL record will reference.
    pub fn release_extended(&self, addr: OverflowAddress) -> EngineResult<()> {
        self.overflow.delete_record(addr, None, FreeReason::Deleted)?;
        self.overflow.release_ref(addr);
        Ok(())
    }

    /// Log the retirement of an overflow log. The file goes once the applier
    /// reaches the record; logs that still hold live records are kept.
    pub fn delete_log(&self, log_id: u32) -> EngineResult<LogPosition> {
        self.check_running()?;
        let record = LogRecord::DeleteLog {
            seq: self.sequence.next(),
            overflow_log_id: log_id,
        };
        Ok(self.writer.append(&record, true)?)
    }

    pub fn compactor_signal(&self, log_id: u32) {
        self.queue.push(log_id);
    }

    /// Random read of one WAL record.
    pub fn read_wal_record(&self, pos: LogPosition) -> EngineResult<LogRecord> {
        Ok(self.writer.read_record(pos)?)
    }

    /// Wait until everything flushed so far has been applied.
    pub fn sync(&self) -> EngineResult<()> {
        self.check_running()?;
        self.barrier().map(|_| ())
    }

    /// Make applied effects durable in the row layer, record where replay
    /// must start, and retire WAL files before it.
    ///
    /// The position is fixed before the row layer syncs. Records applied
    /// after that are replayed again, never skipped.
    pub fn checkpoint(&self) -> EngineResult<Checkpoint> {
        self.check_running()?;
        let position = self.barrier()?;
        self.rows.sync()?;
        self.overflow.sync_all()?;

        let checkpoint = Checkpoint::new(position);
        let files = self.writer.files();
        checkpoint.store(files.dir())?;
        let retired = files.retire_before(checkpoint.position.log_id)?;
        self.metrics.checkpoints.incr();
        info!(position = %checkpoint.position, retired, "checkpoint complete");
        Ok(checkpoint)
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drain the applier, stop both threads, write an end marker and close
    /// the WAL.
    pub fn shutdown(&self) -> EngineResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down engine");
        self.compactor.stop();

        let drained = self.drain();
        if let Err(e) = &drained {
            warn!(error = %e, "applier did not drain before shutdown");
        }
        let closed = self
            .writer
            .append(&LogRecord::EndMarker, true)
            .map(|_| ())
            .and_then(|_| self.writer.close());
        self.applier.stop();
        if let Err(e) = &closed {
            error!(error = %e, "failed to close the WAL");
        }
        closed?;
        drained
    }

    fn drain(&self) -> EngineResult<()> {
        self.barrier().map(|_| ())
    }

    /// Append a Sync record, flush it and wait for the applier to pass it.
    /// Returns the quiescent position once it has.
    fn barrier(&self) -> EngineResult<LogPosition> {
        let seq = self.sequence.next();
        let at = self.writer.append(&LogRecord::Sync { seq }, true)?;
        self.applier.wait_synced(at)
    }

    fn check_running(&self) -> EngineResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.compactor.stop();
        self.applier.stop();
    }
}
