//! Record dispatch
//!
//! Turns WAL records into row-layer effects. The same dispatcher drives the
//! background applier and startup replay, so both apply a record the same
//! way.
//!
//! In replay mode, overflow frees are held back until the log has been
//! replayed to its end. The row layer may already hold effects from after
//! the checkpoint, so an intermediate image seen during replay can be older
//! than what the row finally points at. A held-back free is dropped when the
//! row's final image still references the payload.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{LogRecord, OverflowAddress, RecordMove, RowChange, RowId, RowRef, TableId, TxnId};
use crate::compactor::Watermarks;
use crate::engine::EngineResult;
use crate::observability::Metrics;
use crate::overflow::{FreeReason, OverflowStore};
use crate::rows::{RowImage, RowStore, TableLocks};
use crate::wal::LogPosition;

/// What dispatching one record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Effects reached the row layer.
    Applied,
    /// Held until its transaction commits or aborts.
    Buffered,
    /// Nothing to apply.
    Skipped,
    /// A sync barrier was reached.
    Sync(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOp {
    Insert,
    Update,
    Delete,
}

/// A mutation waiting for its transaction's outcome.
#[derive(Debug, Clone)]
enum Buffered {
    Change(RowOp, RowChange),
    Added(RowRef),
    Freed(RowRef),
}

impl Buffered {
    fn extended(&self) -> Option<(OverflowAddress, TableId, RowId)> {
        match self {
            Buffered::Change(_, c) => c.payload.extended().map(|a| (a, c.table, c.record)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldFree {
    addr: OverflowAddress,
    table: TableId,
    record: RowId,
    reason: FreeReason,
}

pub struct Dispatcher {
    rows: Arc<dyn RowStore>,
    locks: Arc<TableLocks>,
    overflow: Arc<OverflowStore>,
    watermarks: Arc<Watermarks>,
    metrics: Arc<Metrics>,
    pending: HashMap<TxnId, Vec<Buffered>>,
    held_frees: Option<Vec<HeldFree>>,
}

impl Dispatcher {
    pub fn new(
        rows: Arc<dyn RowStore>,
        locks: Arc<TableLocks>,
        overflow: Arc<OverflowStore>,
        watermarks: Arc<Watermarks>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            rows,
            locks,
            overflow,
            watermarks,
            metrics,
            pending: HashMap::new(),
            held_frees: None,
        }
    }

    /// A dispatcher for startup replay. See the module docs.
    pub fn for_replay(
        rows: Arc<dyn RowStore>,
        locks: Arc<TableLocks>,
        overflow: Arc<OverflowStore>,
        watermarks: Arc<Watermarks>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut dispatcher = Self::new(rows, locks, overflow, watermarks, metrics);
        dispatcher.held_frees = Some(Vec::new());
        dispatcher
    }

    /// No transaction has buffered records.
    pub fn is_quiescent(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn open_transactions(&self) -> usize {
        self.pending.len()
    }

    pub fn dispatch(&mut self, pos: LogPosition, record: &LogRecord) -> EngineResult<Dispatched> {
        match record {
            LogRecord::Insert(c) => self.change(RowOp::Insert, c),
            LogRecord::Update(c) => self.change(RowOp::Update, c),
            LogRecord::Delete(c) => self.change(RowOp::Delete, c),
            LogRecord::RowAdded(r) => self.row_ref(r, Buffered::Added(*r)),
            LogRecord::RowFreed(r) => self.row_ref(r, Buffered::Freed(*r)),
            LogRecord::Commit { txn, .. } => {
                self.commit(*txn)?;
                Ok(Dispatched::Applied)
            }
            LogRecord::Abort { txn, .. } => {
                self.abort(*txn)?;
                Ok(Dispatched::Applied)
            }
            LogRecord::RecordMoved(m) => {
                self.record_moved(m)?;
                Ok(Dispatched::Applied)
            }
            LogRecord::DeleteLog { overflow_log_id, .. } => {
                if !self.overflow.delete_log(*overflow_log_id)? {
                    debug!(log_id = overflow_log_id, position = %pos, "overflow log already retired");
                }
                Ok(Dispatched::Applied)
            }
            LogRecord::Sync { seq } => Ok(Dispatched::Sync(*seq)),
            LogRecord::NewLog { next_log_id } => {
                debug!(position = %pos, next_log_id, "applier moving to next WAL file");
                Ok(Dispatched::Skipped)
            }
            LogRecord::Header { .. } | LogRecord::NoOp { .. } | LogRecord::EndMarker => {
                Ok(Dispatched::Skipped)
            }
        }
    }

    fn change(&mut self, op: RowOp, change: &RowChange) -> EngineResult<Dispatched> {
        if change.txn != 0 {
            self.pending
                .entry(change.txn)
                .or_default()
                .push(Buffered::Change(op, change.clone()));
            return Ok(Dispatched::Buffered);
        }
        self.apply_change(op, change)?;
        Ok(Dispatched::Applied)
    }

    fn row_ref(&mut self, r: &RowRef, buffered: Buffered) -> EngineResult<Dispatched> {
        if r.txn != 0 {
            self.pending.entry(r.txn).or_default().push(buffered);
            return Ok(Dispatched::Buffered);
        }
        self.apply(&buffered)?;
        Ok(Dispatched::Applied)
    }

    /// Apply the batch in log order. The batch is dropped only once every
    /// record of it applied, so a retried commit replays the whole batch.
    fn commit(&mut self, txn: TxnId) -> EngineResult<()> {
        let Some(batch) = self.pending.get(&txn).cloned() else {
            return Ok(());
        };
        for buffered in &batch {
            self.apply(buffered)?;
        }
        self.pending.remove(&txn);
        self.metrics.txns_committed.incr();
        Ok(())
    }

    fn abort(&mut self, txn: TxnId) -> EngineResult<()> {
        let Some(batch) = self.pending.remove(&txn) else {
            return Ok(());
        };
        self.drop_batch(batch)?;
        self.metrics.txns_aborted.incr();
        Ok(())
    }

    /// Extended payloads of a batch that will never apply are garbage.
    fn drop_batch(&mut self, batch: Vec<Buffered>) -> EngineResult<()> {
        for (addr, table, record) in batch.iter().filter_map(Buffered::extended) {
            self.free(addr, table, record, FreeReason::Deleted)?;
            self.overflow.release_ref(addr);
        }
        Ok(())
    }

    fn apply(&mut self, buffered: &Buffered) -> EngineResult<()> {
        match buffered {
            Buffered::Change(op, change) => self.apply_change(*op, change),
            Buffered::Added(r) => {
                self.rows.row_added(r.table, r.record)?;
                self.applied(r.table, r.seq);
                Ok(())
            }
            Buffered::Freed(r) => {
                self.rows.row_freed(r.table, r.record)?;
                self.applied(r.table, r.seq);
                Ok(())
            }
        }
    }

    fn apply_change(&mut self, op: RowOp, change: &RowChange) -> EngineResult<()> {
        let (table, record) = (change.table, change.record);
        let _table = self.locks.lock(table);
        let previous = self.image(table, record)?.and_then(|i| i.extended());

        let current = match op {
            RowOp::Delete => {
                self.rows.remove(table, record)?;
                None
            }
            RowOp::Insert | RowOp::Update => {
                let image = RowImage::from(change.payload.clone());
                self.rows.write(table, record, &image.encode())?;
                image.extended()
            }
        };

        if let Some(old) = previous.filter(|old| Some(*old) != current) {
            self.free(old, table, record, FreeReason::Deleted)?;
        }
        if let Some(addr) = change.payload.extended() {
            self.overflow.release_ref(addr);
        }
        self.applied(table, change.seq);
        Ok(())
    }

    fn record_moved(&mut self, m: &RecordMove) -> EngineResult<()> {
        let _table = self.locks.lock(m.table);
        let current = self.image(m.table, m.record)?.and_then(|i| i.extended());

        if current == Some(m.from) {
            self.rows
                .write(m.table, m.record, &RowImage::Extended(m.to).encode())?;
            self.free(m.from, m.table, m.record, FreeReason::Moved)?;
        } else if current == Some(m.to) {
            self.free(m.from, m.table, m.record, FreeReason::Moved)?;
        } else {
            debug!(
                table = m.table,
                record = m.record,
                from = ?m.from,
                "row changed before its move applied, dropping the copy"
            );
            self.free(m.to, m.table, m.record, FreeReason::Deleted)?;
        }
        self.overflow.release_ref(m.to);
        self.applied(m.table, m.seq);
        Ok(())
    }

    fn image(&self, table: TableId, record: RowId) -> EngineResult<Option<RowImage>> {
        match self.rows.read(table, record)? {
            Some(bytes) => Ok(Some(RowImage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn free(
        &mut self,
        addr: OverflowAddress,
        table: TableId,
        record: RowId,
        reason: FreeReason,
    ) -> EngineResult<()> {
        if let Some(held) = self.held_frees.as_mut() {
            held.push(HeldFree {
                addr,
                table,
                record,
                reason,
            });
            return Ok(());
        }
        self.overflow
            .delete_record(addr, Some((table, record)), reason)?;
        Ok(())
    }

    fn applied(&self, table: TableId, seq: u64) {
        self.watermarks.advance(table, seq);
        self.metrics.records_applied.incr();
    }

    /// Drop the batches of transactions that never committed. Returns how
    /// many were discarded.
    pub fn discard_open_transactions(&mut self) -> EngineResult<usize> {
        let open: Vec<(TxnId, Vec<Buffered>)> = self.pending.drain().collect();
        let count = open.len();
        for (txn, batch) in open {
            warn!(txn, records = batch.len(), "discarding uncommitted transaction");
            self.drop_batch(batch)?;
        }
        Ok(count)
    }

    /// Run the frees held back during replay and leave replay mode. Returns
    /// how many records were freed.
    pub fn finish_replay(&mut self) -> EngineResult<usize> {
        let Some(held) = self.held_frees.take() else {
            return Ok(0);
        };
        let mut freed = 0;
        for f in held {
            let _table = self.locks.lock(f.table);
            if self.image(f.table, f.record)?.and_then(|i| i.extended()) == Some(f.addr) {
                continue;
            }
            if self
                .overflow
                .delete_record(f.addr, Some((f.table, f.record)), f.reason)?
            {
                freed += 1;
            }
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::codec::Payload;
    use crate::config::EngineConfig;
    use crate::overflow::{CompactionQueue, LogState, OVERFLOW_RECORD_HEADER_LEN};
    use crate::rows::MemoryRowStore;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        rows: Arc<MemoryRowStore>,
        overflow: Arc<OverflowStore>,
        watermarks: Arc<Watermarks>,
        dispatcher: Dispatcher,
    }

    fn harness(replay: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.block_size = 512;
        config.overflow_log_size = 8192;
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(512, 32, 4, Arc::clone(&metrics)));
        let overflow = Arc::new(
            OverflowStore::open(
                &config,
                cache,
                Arc::new(CompactionQueue::new()),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let rows = Arc::new(MemoryRowStore::new());
        let watermarks = Arc::new(Watermarks::new());
        let parts = (
            Arc::clone(&rows) as Arc<dyn RowStore>,
            Arc::new(TableLocks::new()),
            Arc::clone(&overflow),
            Arc::clone(&watermarks),
            metrics,
        );
        let dispatcher = if replay {
            Dispatcher::for_replay(parts.0, parts.1, parts.2, parts.3, parts.4)
        } else {
            Dispatcher::new(parts.0, parts.1, parts.2, parts.3, parts.4)
        };
        Harness {
            _dir: dir,
            rows,
            overflow,
            watermarks,
            dispatcher,
        }
    }

    fn extended(h: &Harness, record: RowId, len: usize) -> OverflowAddress {
        let mut handle = h.overflow.get_log_for_writing((len + OVERFLOW_RECORD_HEADER_LEN) as u64).unwrap();
        handle.append(5, record, &vec![7u8; len]).unwrap()
    }

    fn insert(txn: TxnId, seq: u64, record: RowId, payload: Payload) -> LogRecord {
        LogRecord::Insert(RowChange::new(txn, seq, 5, record, payload))
    }

    fn image(h: &Harness, record: RowId) -> Option<RowImage> {
        h.rows
            .read(5, record)
            .unwrap()
            .map(|b| RowImage::decode(&b).unwrap())
    }

    const AT: LogPosition = LogPosition::new(1, 0);

    #[test]
    fn test_autocommit_applies_immediately() {
        let mut h = harness(false);
        let out = h
            .dispatcher
            .dispatch(AT, &insert(0, 4, 10, Payload::Inline(b"foo".to_vec())))
            .unwrap();
        assert_eq!(out, Dispatched::Applied);
        assert_eq!(image(&h, 10), Some(RowImage::Inline(b"foo".to_vec())));
        assert_eq!(h.watermarks.get(5), 4);
    }

    #[test]
    fn test_transaction_applies_on_commit_only() {
        let mut h = harness(false);
        let d = &mut h.dispatcher;
        assert_eq!(
            d.dispatch(AT, &insert(9, 1, 10, Payload::Inline(b"a".to_vec()))).unwrap(),
            Dispatched::Buffered
        );
        assert!(!d.is_quiescent());
        assert!(h.rows.is_empty());

        h.dispatcher
            .dispatch(AT, &LogRecord::Commit { txn: 9, seq: 2 })
            .unwrap();
        assert!(h.dispatcher.is_quiescent());
        assert_eq!(image(&h, 10), Some(RowImage::Inline(b"a".to_vec())));
    }

    #[test]
    fn test_abort_frees_extended_payloads() {
        let mut h = harness(false);
        let addr = extended(&h, 10, 300);
        h.dispatcher
            .dispatch(AT, &insert(9, 1, 10, Payload::Extended(addr)))
            .unwrap();
        h.dispatcher
            .dispatch(AT, &LogRecord::Abort { txn: 9, seq: 2 })
            .unwrap();

        assert!(h.rows.is_empty());
        let info = h.overflow.info(addr.log_id).unwrap();
        assert_eq!(info.garbage, 325);
        assert_eq!(info.pending_refs, 0);
    }

    #[test]
    fn test_replacing_extended_payload_frees_old_one() {
        let mut h = harness(false);
        let old = extended(&h, 10, 100);
        h.dispatcher
            .dispatch(AT, &insert(0, 1, 10, Payload::Extended(old)))
            .unwrap();
        h.dispatcher
            .dispatch(
                AT,
                &LogRecord::Update(RowChange::new(0, 2, 5, 10, Payload::Inline(b"small".to_vec()))),
            )
            .unwrap();
        assert_eq!(h.overflow.info(old.log_id).unwrap().garbage, 125);
    }

    #[test]
    fn test_move_rewrites_pointer_when_row_unchanged() {
        let mut h = harness(false);
        let from = extended(&h, 10, 100);
        let to = extended(&h, 10, 100);
        h.dispatcher
            .dispatch(AT, &insert(0, 1, 10, Payload::Extended(from)))
            .unwrap();
        let moved = LogRecord::RecordMoved(RecordMove {
            seq: 2,
            table: 5,
            record: 10,
            from,
            to,
        });
        h.dispatcher.dispatch(AT, &moved).unwrap();

        assert_eq!(image(&h, 10), Some(RowImage::Extended(to)));
        assert_eq!(h.overflow.info(from.log_id).unwrap().garbage, 0, "moves are not garbage");
        assert_eq!(h.watermarks.get(5), 2);
    }

    #[test]
    fn test_move_of_superseded_row_discards_copy() {
        let mut h = harness(false);
        let from = extended(&h, 10, 100);
        let to = extended(&h, 10, 100);
        h.dispatcher
            .dispatch(AT, &insert(0, 1, 10, Payload::Inline(b"newer".to_vec())))
            .unwrap();
        let moved = LogRecord::RecordMoved(RecordMove {
            seq: 2,
            table: 5,
            record: 10,
            from,
            to,
        });
        h.dispatcher.dispatch(AT, &moved).unwrap();

        assert_eq!(image(&h, 10), Some(RowImage::Inline(b"newer".to_vec())));
        assert_eq!(h.overflow.info(to.log_id).unwrap().garbage, 125);
    }

    #[test]
    fn test_replay_keeps_payload_the_row_still_points_at() {
        let mut h = harness(true);
        let a = extended(&h, 10, 100);
        let b = extended(&h, 10, 100);
        // The row layer already holds the later image.
        h.rows
            .write(5, 10, &RowImage::Extended(b).encode())
            .unwrap();

        h.dispatcher
            .dispatch(AT, &insert(0, 1, 10, Payload::Extended(a)))
            .unwrap();
        h.dispatcher
            .dispatch(
                AT,
                &LogRecord::Update(RowChange::new(0, 2, 5, 10, Payload::Extended(b))),
            )
            .unwrap();
        assert_eq!(h.dispatcher.finish_replay().unwrap(), 1);

        assert_eq!(image(&h, 10), Some(RowImage::Extended(b)));
        assert!(h.overflow.live_records(b.log_id, 64).unwrap().iter().any(|r| r.addr == b));
        assert!(!h.overflow.live_records(a.log_id, 64).unwrap().iter().any(|r| r.addr == a));
    }

    #[test]
    fn test_discard_open_transactions_at_end_of_replay() {
        let mut h = harness(true);
        let addr = extended(&h, 11, 200);
        h.dispatcher
            .dispatch(AT, &insert(3, 1, 11, Payload::Extended(addr)))
            .unwrap();
        assert_eq!(h.dispatcher.discard_open_transactions().unwrap(), 1);
        assert_eq!(h.dispatcher.finish_replay().unwrap(), 1);
        assert_eq!(h.overflow.info(addr.log_id).unwrap().garbage, 225);
    }

    #[test]
    fn test_delete_log_of_live_log_is_refused() {
        let mut h = harness(false);
        let addr = extended(&h, 10, 100);
        h.dispatcher
            .dispatch(
                AT,
                &LogRecord::DeleteLog {
                    seq: 1,
                    overflow_log_id: addr.log_id,
                },
            )
            .unwrap();
        assert_eq!(h.overflow.state_of(addr.log_id), Some(LogState::HasSpace));
    }
}
