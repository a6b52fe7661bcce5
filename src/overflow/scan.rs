//! Gap-tolerant record scanning
//!
//! Used when recovering an overflow log and when the compactor walks a
//! victim. Bytes that do not start a valid record are skipped one at a time.
//! A skipped span that is followed by a valid record is counted as garbage;
//! a trailing span is unwritten space.

use tracing::warn;

use super::format::{Incarnation, RecordHeader, RecordStatus, OVERFLOW_RECORD_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord {
    pub offset: u64,
    pub header: RecordHeader,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<ScannedRecord>,
    /// File offset just past the last valid record.
    pub end: u64,
    /// Bytes held by records whose status is deleted.
    pub deleted_bytes: u64,
    /// Bytes skipped between valid records.
    pub skipped_bytes: u64,
}

/// Scan `buf`, which holds the log's bytes starting at file offset `base`.
pub fn scan_records(buf: &[u8], base: u64, incarnation: Incarnation) -> ScanOutcome {
    let log_id = incarnation.log_id;
    let mut outcome = ScanOutcome {
        end: base,
        ..ScanOutcome::default()
    };
    let mut pos = 0usize;
    let mut gap_start: Option<usize> = None;

    while pos + OVERFLOW_RECORD_HEADER_LEN <= buf.len() {
        let Some(header) = valid_record_at(buf, pos, |h, payload| h.verify(payload, incarnation))
        else {
            gap_start.get_or_insert(pos);
            pos += 1;
            continue;
        };

        if let Some(start) = gap_start.take() {
            let skipped = (pos - start) as u64;
            warn!(
                log_id,
                offset = base + start as u64,
                skipped,
                "skipped unreadable bytes in overflow log"
            );
            outcome.skipped_bytes += skipped;
        }
        if header.status == RecordStatus::Deleted {
            outcome.deleted_bytes += header.total_len();
        }
        outcome.records.push(ScannedRecord {
            offset: base + pos as u64,
            header,
        });
        pos += header.total_len() as usize;
        outcome.end = base + pos as u64;
    }
    outcome
}

/// Highest generation any intact record in `buf` claims. Stands in for the
/// header's generation when the header itself is unreadable: records of
/// earlier lives always carry a lower one.
pub fn newest_generation(buf: &[u8], log_id: u32) -> Option<u32> {
    let mut newest = None;
    let mut pos = 0usize;
    while pos + OVERFLOW_RECORD_HEADER_LEN <= buf.len() {
        match valid_record_at(buf, pos, |h, payload| h.self_consistent(payload, log_id)) {
            Some(header) => {
                newest = newest.max(Some(header.generation));
                pos += header.total_len() as usize;
            }
            None => pos += 1,
        }
    }
    newest
}

fn valid_record_at(
    buf: &[u8],
    pos: usize,
    accept: impl Fn(&RecordHeader, &[u8]) -> bool,
) -> Option<RecordHeader> {
    let header = RecordHeader::decode(&buf[pos..])?;
    let start = pos + OVERFLOW_RECORD_HEADER_LEN;
    let payload = buf.get(start..start + header.len as usize)?;
    accept(&header, payload).then_some(header)
}
