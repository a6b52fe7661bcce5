use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::watermark::Watermarks;
use crate::cancel::CancellationToken;
use crate::codec::{LogRecord, RecordMove, TableId};
use crate::config::EngineConfig;
use crate::crash_point::{maybe_crash, points};
use crate::engine::{EngineError, EngineResult};
use crate::observability::Metrics;
use crate::overflow::{CompactionQueue, LiveRecord, LogState, OverflowStore, OVERFLOW_RECORD_HEADER_LEN};
use crate::rows::{RowImage, RowStore, TableLocks};
use crate::wal::{OpSequence, WalWriter};

const THREAD_NAME: &str = "duralog-compactor";
const POLL: Duration = Duration::from_millis(100);

/// Everything the compactor thread touches.
pub struct CompactorDeps {
    pub overflow: Arc<OverflowStore>,
    pub queue: Arc<CompactionQueue>,
    pub writer: Arc<WalWriter>,
    pub rows: Arc<dyn RowStore>,
    pub locks: Arc<TableLocks>,
    pub watermarks: Arc<Watermarks>,
    pub sequence: Arc<OpSequence>,
    pub metrics: Arc<Metrics>,
}

/// Handle to the background compactor thread.
pub struct Compactor {
    cancel: CancellationToken,
    queue: Arc<CompactionQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    pub fn spawn(config: &EngineConfig, deps: CompactorDeps) -> EngineResult<Self> {
        let cancel = CancellationToken::new();
        let queue = Arc::clone(&deps.queue);
        let worker = Worker {
            deps,
            cancel: cancel.clone(),
            backoff: config.retry_backoff(),
            moves: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || worker.run())
            .map_err(|source| EngineError::Spawn {
                name: THREAD_NAME,
                source,
            })?;
        Ok(Self {
            cancel,
            queue,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.queue.wake();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("compactor thread panicked");
            }
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    deps: CompactorDeps,
    cancel: CancellationToken,
    backoff: Duration,
    /// Per victim, the last RecordMoved sequence logged for each table.
    moves: HashMap<u32, HashMap<TableId, u64>>,
}

impl Worker {
    fn run(mut self) {
        debug!("compactor started");
        while let Some(log_id) = self.deps.queue.pop(&self.cancel, POLL) {
            if let Err(e) = self.compact(log_id) {
                error!(log_id, error = %e, code = e.code(), "compaction failed, retrying");
                if self.cancel.sleep(self.backoff) {
                    break;
                }
                self.deps.queue.push(log_id);
            }
        }
        debug!("compactor stopped");
    }

    fn compact(&mut self, log_id: u32) -> EngineResult<()> {
        match self.deps.overflow.state_of(log_id) {
            Some(LogState::ToCompact) => {
                if self.copy_pass(log_id)? {
                    self.retire(log_id)?;
                }
            }
            Some(LogState::Compacted) => self.retire(log_id)?,
            state => debug!(log_id, ?state, "nothing to compact"),
        }
        Ok(())
    }

    /// Copy every live record out of the victim. Returns false if cancelled
    /// part way; the saved resume offset lets the next pass pick up there.
    fn copy_pass(&mut self, log_id: u32) -> EngineResult<bool> {
        let overflow = Arc::clone(&self.deps.overflow);
        if !overflow.wait_refs_drained(log_id, &self.cancel) {
            return Ok(false);
        }
        let Some(info) = overflow.info(log_id) else {
            return Ok(false);
        };
        info!(log_id, resume = info.resume, end = info.end, "compaction pass started");

        let mut copied = 0usize;
        for live in overflow.live_records(log_id, info.resume)? {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            if self.relocate(log_id, &live)? {
                copied += 1;
            }
            let next = live.addr.offset + (OVERFLOW_RECORD_HEADER_LEN as u64) + live.addr.len as u64;
            overflow.set_resume(log_id, next)?;
        }

        overflow.finish_pass(log_id)?;
        self.deps.metrics.compaction_passes.incr();
        info!(log_id, copied, "compaction pass finished");
        Ok(true)
    }

    /// Copy one record if its row still points at it, and log the move.
    fn relocate(&mut self, log_id: u32, live: &LiveRecord) -> EngineResult<bool> {
        let deps = &self.deps;
        let _table = deps.locks.lock(live.table);

        let current = match deps.rows.read(live.table, live.record)? {
            Some(bytes) => RowImage::decode(&bytes)?.extended(),
            None => None,
        };
        if current != Some(live.addr) {
            debug!(addr = ?live.addr, "record no longer referenced, skipping");
            return Ok(false);
        }

        let to = {
            let total = (OVERFLOW_RECORD_HEADER_LEN + live.payload.len()) as u64;
            let mut handle = deps.overflow.get_log_for_writing(total)?;
            let to = handle.append(live.table, live.record, &live.payload)?;
            handle.sync()?;
            to
        };
        maybe_crash(points::COMPACTOR_AFTER_COPY);

        let seq = deps.sequence.next();
        let moved = LogRecord::RecordMoved(RecordMove {
            seq,
            table: live.table,
            record: live.record,
            from: live.addr,
            to,
        });
        if let Err(e) = deps.writer.append(&moved, true) {
            deps.overflow.release_ref(to);
            return Err(e.into());
        }
        maybe_crash(points::COMPACTOR_AFTER_MOVE);

        let last = self.moves.entry(log_id).or_default().entry(live.table).or_insert(0);
        *last = (*last).max(seq);
        Ok(true)
    }

    /// Wait until every move out of the victim has been applied, then log
    /// its DeleteLog.
    fn retire(&mut self, log_id: u32) -> EngineResult<()> {
        if let Some(marks) = self.moves.get(&log_id) {
            for (table, seq) in marks {
                if !self.deps.watermarks.wait_for(*table, *seq, &self.cancel) {
                    return Ok(());
                }
            }
        }

        let seq = self.deps.sequence.next();
        self.deps.writer.append(
            &LogRecord::DeleteLog {
                seq,
                overflow_log_id: log_id,
            },
            true,
        )?;
        self.deps.overflow.mark_to_delete(log_id);
        self.moves.remove(&log_id);
        info!(log_id, "overflow log scheduled for deletion");
        Ok(())
    }
}
