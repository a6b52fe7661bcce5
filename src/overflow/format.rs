//! On-disk layout of overflow logs
//!
//! ```text
//! header (64 bytes):
//! +-------+--------+------------+---------+--------+-------+---------+
//! | magic | log_id | generation | garbage | resume | crc32 | padding |
//! |  u32  |  u32   |    u32     |   u64   |  u64   |  u32  |         |
//! +-------+--------+------------+---------+--------+-------+---------+
//!
//! record:
//! +--------+-------+------------+-------+--------+-----+-------+
//! | status | crc32 | generation | table | record | len | bytes |
//! |   u8   |  u32  |    u32     |  u32  |  u64   | u32 |       |
//! +--------+-------+------------+-------+--------+-----+-------+
//! ```
//!
//! A file's generation grows by one every time it is recycled. The record
//! checksum covers everything after it and is offset by the log id, so a
//! record only verifies under the exact (log id, generation) it was written
//! for. An id can come back to the same file after two recycles; the
//! generation cannot. The status byte sits outside the checksum so deletion
//! can flip it in place.

use crc32fast::Hasher;

use crate::codec::{RowId, TableId};

pub const OVERFLOW_MAGIC: u32 = 0x4F56_464C;
pub const OVERFLOW_HEADER_LEN: usize = 64;
pub const OVERFLOW_RECORD_HEADER_LEN: usize = 25;

const HEADER_CRC_AT: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordStatus {
    Ok = 1,
    Deleted = 2,
}

impl RecordStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordStatus::Ok),
            2 => Some(RecordStatus::Deleted),
            _ => None,
        }
    }
}

/// One life of an overflow file: the id it is named under and how many
/// times it has been recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incarnation {
    pub log_id: u32,
    pub generation: u32,
}

impl Incarnation {
    pub fn new(log_id: u32, generation: u32) -> Self {
        Self { log_id, generation }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub log_id: u32,
    pub generation: u32,
    pub garbage: u64,
    pub resume: u64,
}

impl LogHeader {
    pub fn fresh(incarnation: Incarnation) -> Self {
        Self {
            log_id: incarnation.log_id,
            generation: incarnation.generation,
            garbage: 0,
            resume: OVERFLOW_HEADER_LEN as u64,
        }
    }

    pub fn encode(&self) -> [u8; OVERFLOW_HEADER_LEN] {
        let mut out = [0u8; OVERFLOW_HEADER_LEN];
        out[0..4].copy_from_slice(&OVERFLOW_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.log_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.generation.to_le_bytes());
        out[12..20].copy_from_slice(&self.garbage.to_le_bytes());
        out[20..28].copy_from_slice(&self.resume.to_le_bytes());
        let crc = crc32fast::hash(&out[..HEADER_CRC_AT]);
        out[HEADER_CRC_AT..HEADER_CRC_AT + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// `None` when the magic or checksum is wrong.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < OVERFLOW_HEADER_LEN {
            return None;
        }
        let stored = u32::from_le_bytes(buf[HEADER_CRC_AT..HEADER_CRC_AT + 4].try_into().ok()?);
        if read_u32(buf, 0) != OVERFLOW_MAGIC || crc32fast::hash(&buf[..HEADER_CRC_AT]) != stored {
            return None;
        }
        Some(Self {
            log_id: read_u32(buf, 4),
            generation: read_u32(buf, 8),
            garbage: read_u64(buf, 12),
            resume: read_u64(buf, 20),
        })
    }
}

/// Parsed record header, with its payload still in the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub status: RecordStatus,
    pub checksum: u32,
    pub generation: u32,
    pub table: TableId,
    pub record: RowId,
    pub len: u32,
}

impl RecordHeader {
    pub fn total_len(&self) -> u64 {
        (OVERFLOW_RECORD_HEADER_LEN + self.len as usize) as u64
    }

    /// `None` when the status byte is not a written status.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < OVERFLOW_RECORD_HEADER_LEN {
            return None;
        }
        Some(Self {
            status: RecordStatus::from_u8(buf[0])?,
            checksum: read_u32(buf, 1),
            generation: read_u32(buf, 5),
            table: read_u32(buf, 9),
            record: read_u64(buf, 13),
            len: read_u32(buf, 21),
        })
    }

    pub fn verify(&self, payload: &[u8], incarnation: Incarnation) -> bool {
        self.generation == incarnation.generation
            && self.self_consistent(payload, incarnation.log_id)
    }

    /// Checks the record against the generation it claims. Only recovery of
    /// a log whose header is lost has to trust that claim.
    pub fn self_consistent(&self, payload: &[u8], log_id: u32) -> bool {
        let claimed = Incarnation::new(log_id, self.generation);
        payload.len() == self.len as usize
            && record_checksum(claimed, self.table, self.record, payload) == self.checksum
    }
}

pub fn record_checksum(
    incarnation: Incarnation,
    table: TableId,
    record: RowId,
    payload: &[u8],
) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&incarnation.generation.to_le_bytes());
    hasher.update(&table.to_le_bytes());
    hasher.update(&record.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize().wrapping_add(incarnation.log_id)
}

pub fn encode_record(
    incarnation: Incarnation,
    table: TableId,
    record: RowId,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(OVERFLOW_RECORD_HEADER_LEN + payload.len());
    out.push(RecordStatus::Ok as u8);
    out.extend_from_slice(&record_checksum(incarnation, table, record, payload).to_le_bytes());
    out.extend_from_slice(&incarnation.generation.to_le_bytes());
    out.extend_from_slice(&table.to_le_bytes());
    out.extend_from_slice(&record.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_checksum_detects_damage() {
        let header = LogHeader {
            log_id: 9,
            generation: 3,
            garbage: 1234,
            resume: 640,
        };
        let mut bytes = header.encode();
        assert_eq!(LogHeader::decode(&bytes), Some(header));
        bytes[10] ^= 1;
        assert_eq!(LogHeader::decode(&bytes), None);
    }

    #[test]
    fn test_record_is_bound_to_log_id() {
        let bytes = encode_record(Incarnation::new(4, 0), 5, 10, b"payload");
        let header = RecordHeader::decode(&bytes).unwrap();
        let payload = &bytes[OVERFLOW_RECORD_HEADER_LEN..];
        assert_eq!(header.total_len(), bytes.len() as u64);
        assert!(header.verify(payload, Incarnation::new(4, 0)));
        assert!(!header.verify(payload, Incarnation::new(5, 0)));
    }

    #[test]
    fn test_record_is_bound_to_generation() {
        // The same id handed back to the file after two recycles.
        let bytes = encode_record(Incarnation::new(4, 1), 5, 10, b"payload");
        let header = RecordHeader::decode(&bytes).unwrap();
        let payload = &bytes[OVERFLOW_RECORD_HEADER_LEN..];
        assert!(!header.verify(payload, Incarnation::new(4, 3)));
        assert!(header.self_consistent(payload, 4));
        assert_eq!(header.generation, 1);
    }

    #[test]
    fn test_forged_generation_fails_checksum() {
        let mut bytes = encode_record(Incarnation::new(4, 1), 5, 10, b"payload");
        bytes[5..9].copy_from_slice(&3u32.to_le_bytes());
        let header = RecordHeader::decode(&bytes).unwrap();
        let payload = &bytes[OVERFLOW_RECORD_HEADER_LEN..];
        assert!(!header.verify(payload, Incarnation::new(4, 3)));
    }

    #[test]
    fn test_unwritten_status_is_not_a_record() {
        assert!(RecordHeader::decode(&[0u8; OVERFLOW_RECORD_HEADER_LEN]).is_none());
    }
}
