//! WAL replay for recovery
//!
//! Replays every record from the checkpoint (or the oldest log) to the end of
//! the WAL through the applier's dispatcher.
//!
//! - Records are read strictly: a damaged record that is not the torn tail
//!   of the last log is fatal.
//! - Transactions without a Commit at the end of the log are discarded.
//! - Replay is idempotent: the same WAL replayed twice yields the same state.

use std::sync::Arc;

use tracing::{debug, info};

use crate::applier::{Dispatched, Dispatcher};
use crate::engine::EngineResult;
use crate::wal::{LogPosition, WalFiles, WalReader};

/// Statistics from WAL replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Where replay started, if there was any WAL.
    pub start: Option<LogPosition>,
    /// Position just past the last valid record.
    pub end: Option<LogPosition>,
    pub records: u64,
    pub applied: u64,
    pub buffered: u64,
    /// Transactions still open at the end of the log.
    pub discarded_txns: usize,
    /// Overflow records freed once replay finished.
    pub freed_records: usize,
    /// Highest operation sequence seen.
    pub max_seq: u64,
}

pub struct WalReplayer;

impl WalReplayer {
    /// Replay from `checkpoint`, or from the start of the oldest log when
    /// there is none.
    pub fn replay(
        files: &Arc<WalFiles>,
        checkpoint: Option<LogPosition>,
        dispatcher: &mut Dispatcher,
        max_record_len: usize,
    ) -> EngineResult<ReplayStats> {
        let start = match checkpoint {
            Some(pos) => Some(pos),
            None => files
                .list_logs()?
                .first()
                .map(|id| LogPosition::new(*id, 0)),
        };
        let mut stats = ReplayStats {
            start,
            ..ReplayStats::default()
        };
        let Some(start) = start else {
            info!("no WAL to replay");
            return Ok(stats);
        };

        let mut reader = WalReader::new(Arc::clone(files), start, max_record_len);
        while let Some((pos, record)) = reader.seq_next(None)? {
            stats.records += 1;
            if let Some(seq) = record.seq() {
                stats.max_seq = stats.max_seq.max(seq);
            }
            match dispatcher.dispatch(pos, &record)? {
                Dispatched::Applied => stats.applied += 1,
                Dispatched::Buffered => stats.buffered += 1,
                Dispatched::Skipped | Dispatched::Sync(_) => {}
            }
        }
        stats.end = Some(reader.position());
        debug!(end = %reader.position(), "reached end of WAL");

        stats.discarded_txns = dispatcher.discard_open_transactions()?;
        stats.freed_records = dispatcher.finish_replay()?;

        info!(
            start = %start,
            end = %reader.position(),
            records = stats.records,
            applied = stats.applied,
            discarded_txns = stats.discarded_txns,
            freed_records = stats.freed_records,
            "WAL replay complete"
        );
        Ok(stats)
    }
}
