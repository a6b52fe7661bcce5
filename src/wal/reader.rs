//! Strict sequential WAL reader
//!
//! Used by recovery and by the background applier. Every record is
//! checksum-verified against the log id it is read under, and the first
//! invalid record ends the scan: it is either the true end of the log or
//! unrecoverable corruption. Nothing is ever skipped.
//!
//! End-of-log rules:
//! - with a `limit` (the live flush frontier) everything before the limit is
//!   durable, so an invalid record there is corruption;
//! - without a limit, an invalid record in the last log ends the scan;
//! - an invalid record in a log that has a successor ends that log only when
//!   the successor's Header names this log and this offset.

use std::sync::Arc;

use tracing::debug;

use super::errors::{WalError, WalResult};
use super::position::LogPosition;
use crate::codec::{decode, CodecError, Decoded, LogRecord};

const MIN_READ_AHEAD: usize = 64 * 1024;

/// Byte source the reader pulls WAL bytes from.
pub trait LogSource {
    /// Fill `out` from `log_id` at `offset`. Unwritten space reads as zeros.
    fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()>;

    fn log_exists(&self, log_id: u64) -> bool;

    fn log_size(&self) -> u64;
}

impl<T: LogSource + ?Sized> LogSource for &T {
    fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
        (**self).read_at(log_id, offset, out)
    }

    fn log_exists(&self, log_id: u64) -> bool {
        (**self).log_exists(log_id)
    }

    fn log_size(&self) -> u64 {
        (**self).log_size()
    }
}

impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
        (**self).read_at(log_id, offset, out)
    }

    fn log_exists(&self, log_id: u64) -> bool {
        (**self).log_exists(log_id)
    }

    fn log_size(&self) -> u64 {
        (**self).log_size()
    }
}

enum Step {
    Record(LogRecord, usize),
    Invalid(String),
}

pub struct WalReader<S> {
    source: S,
    pos: LogPosition,
    /// Bytes read ahead, starting at `window_start`.
    window: Vec<u8>,
    window_start: LogPosition,
    read_ahead: usize,
}

impl<S: LogSource> WalReader<S> {
    pub fn new(source: S, start: LogPosition, max_record_len: usize) -> Self {
        Self {
            source,
            pos: start,
            window: Vec::new(),
            window_start: start,
            read_ahead: MIN_READ_AHEAD.max(max_record_len),
        }
    }

    /// Position of the next record to be read.
    pub fn position(&self) -> LogPosition {
        self.pos
    }

    /// Read the next record and its position. `Ok(None)` is the end of the
    /// log, or `limit` reached.
    pub fn seq_next(
        &mut self,
        limit: Option<LogPosition>,
    ) -> WalResult<Option<(LogPosition, LogRecord)>> {
        loop {
            if limit.is_some_and(|limit| self.pos >= limit) {
                return Ok(None);
            }

            let at = self.pos;
            match self.step(limit)? {
                Step::Record(record, len) => {
                    match &record {
                        LogRecord::NewLog { next_log_id } => {
                            if *next_log_id != at.log_id + 1 {
                                return Err(WalError::corruption(
                                    at,
                                    format!("new-log record names log {}", next_log_id),
                                ));
                            }
                            self.pos = LogPosition::new(*next_log_id, 0);
                        }
                        _ => self.pos = LogPosition::new(at.log_id, at.offset + len as u64),
                    }
                    return Ok(Some((at, record)));
                }
                Step::Invalid(reason) => {
                    if limit.is_some() {
                        return Err(WalError::corruption(at, reason));
                    }
                    if !self.continue_in_successor(&reason)? {
                        debug!(end = %at, reason = %reason, "end of WAL");
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Decode the record at the current position.
    fn step(&mut self, limit: Option<LogPosition>) -> WalResult<Step> {
        let at = self.pos;
        let log_size = self.source.log_size();
        if at.offset >= log_size {
            return Ok(Step::Invalid("ran past the end of the log".into()));
        }
        if self.buffered() == 0 && !self.source.log_exists(at.log_id) {
            return Ok(Step::Invalid("log file does not exist".into()));
        }
        let mut avail = (log_size - at.offset) as usize;
        if let Some(limit) = limit.filter(|l| l.log_id == at.log_id) {
            avail = avail.min((limit.offset - at.offset) as usize);
        }

        if self.buffered() == 0 {
            self.fill(self.read_ahead.min(avail))?;
        }
        loop {
            let rel = (at.offset - self.window_start.offset) as usize;
            let bytes = &self.window[rel..];
            let decoded = match decode(bytes, at.log_id) {
                Err(CodecError::Incomplete { needed, .. }) => {
                    if needed > avail || bytes.len() >= avail {
                        return Ok(Step::Invalid("truncated record".into()));
                    }
                    self.fill(self.read_ahead.max(needed).min(avail))?;
                    continue;
                }
                Err(e) => return Ok(Step::Invalid(e.to_string())),
                Ok(Decoded::Unwritten) => return Ok(Step::Invalid("unwritten space".into())),
                Ok(Decoded::Record { record, len }) => (record, len),
            };

            let (record, len) = decoded;
            let is_header = matches!(record, LogRecord::Header { .. });
            if at.offset == 0 && !is_header {
                return Ok(Step::Invalid("first record of a log is not a header".into()));
            }
            if at.offset != 0 && is_header {
                return Ok(Step::Invalid("header record inside a log".into()));
            }
            return Ok(Step::Record(record, len));
        }
    }

    /// Bytes of the window at or after the current position.
    fn buffered(&self) -> usize {
        let start = self.window_start;
        let end = start.offset + self.window.len() as u64;
        if start.log_id != self.pos.log_id || self.pos.offset < start.offset || self.pos.offset >= end {
            return 0;
        }
        (end - self.pos.offset) as usize
    }

    fn fill(&mut self, len: usize) -> WalResult<()> {
        self.window.resize(len, 0);
        self.source.read_at(self.pos.log_id, self.pos.offset, &mut self.window)?;
        self.window_start = self.pos;
        Ok(())
    }

    /// The current log ended at an invalid record. Move into the successor
    /// if it links back to exactly this position.
    fn continue_in_successor(&mut self, reason: &str) -> WalResult<bool> {
        let at = self.pos;
        let next = at.log_id + 1;
        if !self.source.log_exists(next) {
            return Ok(false);
        }

        let mut head = [0u8; 64];
        self.source.read_at(next, 0, &mut head)?;
        match decode(&head, next) {
            Ok(Decoded::Record {
                record:
                    LogRecord::Header {
                        prev_log_id,
                        prev_end,
                        ..
                    },
                ..
            }) => {
                if prev_log_id == at.log_id && prev_end == at.offset {
                    debug!(from = %at, to = next, "WAL continues after torn tail");
                    self.pos = LogPosition::new(next, 0);
                    self.window.clear();
                    Ok(true)
                } else {
                    Err(WalError::corruption(
                        at,
                        format!(
                            "{}; log {} follows from {}:{}",
                            reason, next, prev_log_id, prev_end
                        ),
                    ))
                }
            }
            _ if !self.source.log_exists(next + 1) => Ok(false),
            _ => Err(WalError::corruption(
                at,
                format!("{}; log {} has no valid header", reason, next),
            )),
        }
    }
}

impl<S: LogSource> Iterator for WalReader<S> {
    type Item = WalResult<(LogPosition, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.seq_next(None).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Payload, RowChange};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    const LOG_SIZE: u64 = 1024;

    /// In-memory logs for exercising the end-of-log rules.
    #[derive(Default)]
    struct MemLogs {
        logs: Mutex<BTreeMap<u64, Vec<u8>>>,
    }

    impl MemLogs {
        fn push(&self, log_id: u64, record: &LogRecord) -> u64 {
            let mut logs = self.logs.lock();
            let log = logs.entry(log_id).or_default();
            let offset = log.len() as u64;
            record.encode_into(log, log_id).unwrap();
            offset
        }

        fn header(&self, log_id: u64, prev_log_id: u64, prev_end: u64) {
            self.push(
                log_id,
                &LogRecord::Header {
                    log_id,
                    prev_log_id,
                    prev_end,
                },
            );
        }

        fn corrupt(&self, log_id: u64, offset: usize) {
            self.logs.lock().get_mut(&log_id).unwrap()[offset] ^= 0xff;
        }
    }

    impl LogSource for MemLogs {
        fn read_at(&self, log_id: u64, offset: u64, out: &mut [u8]) -> WalResult<()> {
            out.fill(0);
            if let Some(log) = self.logs.lock().get(&log_id) {
                let start = (offset as usize).min(log.len());
                let n = (log.len() - start).min(out.len());
                out[..n].copy_from_slice(&log[start..start + n]);
            }
            Ok(())
        }

        fn log_exists(&self, log_id: u64) -> bool {
            self.logs.lock().contains_key(&log_id)
        }

        fn log_size(&self) -> u64 {
            LOG_SIZE
        }
    }

    fn insert(seq: u64) -> LogRecord {
        LogRecord::Insert(RowChange::new(0, seq, 1, seq, Payload::Inline(vec![seq as u8; 20])))
    }

    fn read_all(logs: &MemLogs, start: LogPosition) -> WalResult<Vec<LogRecord>> {
        WalReader::new(logs, start, 128)
            .map(|r| r.map(|(_, record)| record))
            .collect()
    }

    fn inserts(records: &[LogRecord]) -> Vec<u64> {
        records
            .iter()
            .filter_map(|r| match r {
                LogRecord::Insert(c) => Some(c.seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_reads_across_rolled_logs() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &insert(1));
        logs.push(1, &LogRecord::NewLog { next_log_id: 2 });
        logs.header(2, 1, 0);
        logs.push(2, &insert(2));

        let records = read_all(&logs, LogPosition::new(1, 0)).unwrap();
        assert_eq!(inserts(&records), vec![1, 2]);
    }

    #[test]
    fn test_torn_tail_in_last_log_is_end() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &insert(1));
        let torn = logs.push(1, &insert(2));
        logs.corrupt(1, torn as usize + 5);

        let mut reader = WalReader::new(&logs, LogPosition::new(1, 0), 128);
        while reader.seq_next(None).unwrap().is_some() {}
        assert_eq!(reader.position(), LogPosition::new(1, torn));
    }

    #[test]
    fn test_linked_successor_continues_after_torn_tail() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &insert(1));
        let torn = logs.push(1, &insert(2));
        logs.corrupt(1, torn as usize + 5);
        logs.header(2, 1, torn);
        logs.push(2, &insert(3));

        let records = read_all(&logs, LogPosition::new(1, 0)).unwrap();
        assert_eq!(inserts(&records), vec![1, 3]);
    }

    #[test]
    fn test_unlinked_successor_is_corruption() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &insert(1));
        let bad = logs.push(1, &insert(2));
        logs.corrupt(1, bad as usize + 5);
        logs.header(2, 1, 999);

        let err = read_all(&logs, LogPosition::new(1, 0)).unwrap_err();
        assert!(matches!(err, WalError::Corruption { .. }), "{}", err);
    }

    #[test]
    fn test_successor_without_header_is_end_only_when_last() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &insert(1));
        logs.logs.lock().insert(2, vec![0u8; 16]);
        assert_eq!(inserts(&read_all(&logs, LogPosition::new(1, 0)).unwrap()), vec![1]);

        logs.header(3, 2, 0);
        assert!(read_all(&logs, LogPosition::new(1, 0)).is_err());
    }

    #[test]
    fn test_limit_stops_reading_and_invalid_before_limit_is_corruption() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &insert(1));
        let third = logs.push(1, &insert(2));

        let mut reader = WalReader::new(&logs, LogPosition::new(1, 0), 128);
        let limit = Some(LogPosition::new(1, third));
        assert!(reader.seq_next(limit).unwrap().is_some());
        assert!(reader.seq_next(limit).unwrap().is_some());
        assert!(reader.seq_next(limit).unwrap().is_none());

        let far = Some(LogPosition::new(1, 900));
        assert!(reader.seq_next(far).unwrap().is_some());
        assert!(matches!(reader.seq_next(far), Err(WalError::Corruption { .. })));
    }

    #[test]
    fn test_new_log_must_name_successor() {
        let logs = MemLogs::default();
        logs.header(1, 0, 0);
        logs.push(1, &LogRecord::NewLog { next_log_id: 5 });
        assert!(read_all(&logs, LogPosition::new(1, 0)).is_err());
    }
}
