use super::checksum::{wal_checksum, CRC_LEN_U8};
use super::errors::{CodecError, CodecResult};
use super::kind::RecordKind;
use super::types::{OverflowAddress, Payload, RowId, TableId, TxnId, OVERFLOW_ADDRESS_LEN};

/// Magic carried by every WAL Header record.
pub const WAL_MAGIC: u32 = 0x4C41_5744;

/// Inline payloads longer than this are rejected as malformed while decoding,
/// so a garbage length field cannot make a reader wait for megabytes.
const MAX_INLINE_LEN: usize = 1 << 24;

const PAYLOAD_INLINE: u8 = 0;
const PAYLOAD_EXTENDED: u8 = 1;

/// Insert, update or delete of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub txn: TxnId,
    pub seq: u64,
    pub table: TableId,
    pub record: RowId,
    /// Free-list link; only inserts and deletes carry one.
    pub free_link: Option<RowId>,
    pub payload: Payload,
}

impl RowChange {
    pub fn new(txn: TxnId, seq: u64, table: TableId, record: RowId, payload: Payload) -> Self {
        Self {
            txn,
            seq,
            table,
            record,
            free_link: None,
            payload,
        }
    }

    pub fn with_free_link(mut self, link: RowId) -> Self {
        self.free_link = Some(link);
        self
    }
}

/// Row slot allocation or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub txn: TxnId,
    pub seq: u64,
    pub table: TableId,
    pub record: RowId,
}

/// Relocation of an extended payload by the compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMove {
    pub seq: u64,
    pub table: TableId,
    pub record: RowId,
    pub from: OverflowAddress,
    pub to: OverflowAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// First record of every WAL file.
    Header {
        log_id: u64,
        prev_log_id: u64,
        /// Offset where the previous log's valid records ended.
        prev_end: u64,
    },
    /// Last record of a log that rolled over.
    NewLog { next_log_id: u64 },
    DeleteLog { seq: u64, overflow_log_id: u32 },
    Commit { txn: TxnId, seq: u64 },
    Abort { txn: TxnId, seq: u64 },
    Insert(RowChange),
    Update(RowChange),
    Delete(RowChange),
    RowAdded(RowRef),
    RowFreed(RowRef),
    RecordMoved(RecordMove),
    NoOp { fill: u16 },
    /// Written on clean shutdown.
    EndMarker,
    Sync { seq: u64 },
}

/// Outcome of decoding at a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record { record: LogRecord, len: usize },
    /// A zero kind byte: space the writer has not reached.
    Unwritten,
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Header { .. } => RecordKind::Header,
            LogRecord::NewLog { .. } => RecordKind::NewLog,
            LogRecord::DeleteLog { .. } => RecordKind::DeleteLog,
            LogRecord::Commit { .. } => RecordKind::Commit,
            LogRecord::Abort { .. } => RecordKind::Abort,
            LogRecord::Insert(c) if c.free_link.is_some() => RecordKind::InsertLinked,
            LogRecord::Insert(_) => RecordKind::Insert,
            LogRecord::Update(_) => RecordKind::Update,
            LogRecord::Delete(c) if c.free_link.is_some() => RecordKind::DeleteLinked,
            LogRecord::Delete(_) => RecordKind::Delete,
            LogRecord::RowAdded(_) => RecordKind::RowAdded,
            LogRecord::RowFreed(_) => RecordKind::RowFreed,
            LogRecord::RecordMoved(_) => RecordKind::RecordMoved,
            LogRecord::NoOp { .. } => RecordKind::NoOp,
            LogRecord::EndMarker => RecordKind::EndMarker,
            LogRecord::Sync { .. } => RecordKind::Sync,
        }
    }

    /// Operation sequence number, for records that carry one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            LogRecord::DeleteLog { seq, .. }
            | LogRecord::Commit { seq, .. }
            | LogRecord::Abort { seq, .. }
            | LogRecord::Sync { seq } => Some(*seq),
            LogRecord::Insert(c) | LogRecord::Update(c) | LogRecord::Delete(c) => Some(c.seq),
            LogRecord::RowAdded(r) | LogRecord::RowFreed(r) => Some(r.seq),
            LogRecord::RecordMoved(m) => Some(m.seq),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.kind().checksum_width() + self.body_len()
    }

    fn body_len(&self) -> usize {
        match self {
            LogRecord::Header { .. } => 28,
            LogRecord::NewLog { .. } => 8,
            LogRecord::DeleteLog { .. } => 12,
            LogRecord::Commit { .. } | LogRecord::Abort { .. } => 16,
            LogRecord::Insert(c) | LogRecord::Update(c) | LogRecord::Delete(c) => {
                let link = if c.free_link.is_some() { 8 } else { 0 };
                28 + link + c.payload.encoded_len()
            }
            LogRecord::RowAdded(_) | LogRecord::RowFreed(_) => 28,
            LogRecord::RecordMoved(_) => 20 + 2 * OVERFLOW_ADDRESS_LEN,
            LogRecord::NoOp { fill } => 2 + *fill as usize,
            LogRecord::EndMarker => 0,
            LogRecord::Sync { .. } => 8,
        }
    }

    /// Append the encoded record, checksummed for `log_id`, to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>, log_id: u64) -> CodecResult<()> {
        if let LogRecord::Update(c) = self {
            if c.free_link.is_some() {
                return Err(CodecError::Malformed("updates carry no free-list link"));
            }
        }

        let kind = self.kind();
        let width = kind.checksum_width();
        let start = out.len();
        out.push(kind.as_u8());
        out.extend_from_slice(&[0u8; 2][..width]);
        let body_start = out.len();
        self.write_body(out);
        debug_assert_eq!(out.len() - start, self.encoded_len());

        let checksum = wal_checksum(kind.as_u8(), &out[body_start..], log_id, width);
        if width == CRC_LEN_U8 {
            out[start + 1] = checksum as u8;
        } else {
            out[start + 1..start + 3].copy_from_slice(&checksum.to_le_bytes());
        }
        Ok(())
    }

    pub fn encode(&self, log_id: u64) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out, log_id)?;
        Ok(out)
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match self {
            LogRecord::Header {
                log_id,
                prev_log_id,
                prev_end,
            } => {
                out.extend_from_slice(&WAL_MAGIC.to_le_bytes());
                out.extend_from_slice(&log_id.to_le_bytes());
                out.extend_from_slice(&prev_log_id.to_le_bytes());
                out.extend_from_slice(&prev_end.to_le_bytes());
            }
            LogRecord::NewLog { next_log_id } => out.extend_from_slice(&next_log_id.to_le_bytes()),
            LogRecord::DeleteLog {
                seq,
                overflow_log_id,
            } => {
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(&overflow_log_id.to_le_bytes());
            }
            LogRecord::Commit { txn, seq } | LogRecord::Abort { txn, seq } => {
                out.extend_from_slice(&txn.to_le_bytes());
                out.extend_from_slice(&seq.to_le_bytes());
            }
            LogRecord::Insert(c) | LogRecord::Update(c) | LogRecord::Delete(c) => {
                out.extend_from_slice(&c.txn.to_le_bytes());
                out.extend_from_slice(&c.seq.to_le_bytes());
                out.extend_from_slice(&c.table.to_le_bytes());
                out.extend_from_slice(&c.record.to_le_bytes());
                if let Some(link) = c.free_link {
                    out.extend_from_slice(&link.to_le_bytes());
                }
                match &c.payload {
                    Payload::Inline(bytes) => {
                        out.push(PAYLOAD_INLINE);
                        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                        out.extend_from_slice(bytes);
                    }
                    Payload::Extended(addr) => {
                        out.push(PAYLOAD_EXTENDED);
                        addr.encode_into(out);
                    }
                }
            }
            LogRecord::RowAdded(r) | LogRecord::RowFreed(r) => {
                out.extend_from_slice(&r.txn.to_le_bytes());
                out.extend_from_slice(&r.seq.to_le_bytes());
                out.extend_from_slice(&r.table.to_le_bytes());
                out.extend_from_slice(&r.record.to_le_bytes());
            }
            LogRecord::RecordMoved(m) => {
                out.extend_from_slice(&m.seq.to_le_bytes());
                out.extend_from_slice(&m.table.to_le_bytes());
                out.extend_from_slice(&m.record.to_le_bytes());
                m.from.encode_into(out);
                m.to.encode_into(out);
            }
            LogRecord::NoOp { fill } => {
                out.extend_from_slice(&fill.to_le_bytes());
                out.resize(out.len() + *fill as usize, 0);
            }
            LogRecord::EndMarker => {}
            LogRecord::Sync { seq } => out.extend_from_slice(&seq.to_le_bytes()),
        }
    }
}

/// Decode the record at the start of `buf`, verifying it against `log_id`.
///
/// `Incomplete` means the buffer is too short to hold the record whose
/// prefix it contains; the caller decides whether more bytes can exist.
pub fn decode(buf: &[u8], log_id: u64) -> CodecResult<Decoded> {
    let Some(&kind_byte) = buf.first() else {
        return Err(CodecError::Incomplete {
            needed: 1,
            available: 0,
        });
    };
    if kind_byte == 0 {
        return Ok(Decoded::Unwritten);
    }
    let kind = RecordKind::from_u8(kind_byte).ok_or(CodecError::UnknownKind(kind_byte))?;
    let width = kind.checksum_width();
    let header_len = 1 + width;

    let total = required_len(kind, header_len, buf)?;
    if buf.len() < total {
        return Err(CodecError::Incomplete {
            needed: total,
            available: buf.len(),
        });
    }

    let body = &buf[header_len..total];
    let stored = if width == CRC_LEN_U8 {
        buf[1] as u16
    } else {
        u16::from_le_bytes([buf[1], buf[2]])
    };
    let computed = wal_checksum(kind_byte, body, log_id, width);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch {
            kind: kind.name(),
            stored,
            computed,
        });
    }

    let record = parse_body(kind, body, log_id)?;
    Ok(Decoded::Record { record, len: total })
}

fn need(buf: &[u8], n: usize) -> CodecResult<()> {
    if buf.len() < n {
        Err(CodecError::Incomplete {
            needed: n,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Total encoded length of the record starting at `buf[0]`, determined from
/// as short a prefix as possible.
fn required_len(kind: RecordKind, header_len: usize, buf: &[u8]) -> CodecResult<usize> {
    use RecordKind::*;
    let fixed = match kind {
        Header | RowAdded | RowFreed => 28,
        NewLog | Sync => 8,
        DeleteLog => 12,
        Commit | Abort => 16,
        RecordMoved => 20 + 2 * OVERFLOW_ADDRESS_LEN,
        EndMarker => 0,
        NoOp => {
            let at = header_len;
            need(buf, at + 2)?;
            let fill = u16::from_le_bytes([buf[at], buf[at + 1]]) as usize;
            return Ok(at + 2 + fill);
        }
        Insert | Update | Delete | InsertLinked | DeleteLinked => {
            let mut at = header_len + 28;
            if matches!(kind, InsertLinked | DeleteLinked) {
                at += 8;
            }
            need(buf, at + 1)?;
            return match buf[at] {
                PAYLOAD_INLINE => {
                    need(buf, at + 5)?;
                    let len = u32::from_le_bytes([buf[at + 1], buf[at + 2], buf[at + 3], buf[at + 4]])
                        as usize;
                    if len > MAX_INLINE_LEN {
                        return Err(CodecError::Malformed("inline payload length out of range"));
                    }
                    Ok(at + 5 + len)
                }
                PAYLOAD_EXTENDED => Ok(at + 1 + OVERFLOW_ADDRESS_LEN),
                _ => Err(CodecError::Malformed("unknown payload tag")),
            };
        }
    };
    Ok(header_len + fixed)
}

/// Little-endian cursor over a body whose length was already checked.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(CodecError::Malformed("record body shorter than its fields"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CodecResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CodecResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CodecResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn address(&mut self) -> CodecResult<OverflowAddress> {
        OverflowAddress::decode(self.take(OVERFLOW_ADDRESS_LEN)?)
    }
}

fn parse_body(kind: RecordKind, body: &[u8], log_id: u64) -> CodecResult<LogRecord> {
    use RecordKind::*;
    let mut c = Cursor::new(body);
    let record = match kind {
        Header => {
            if c.u32()? != WAL_MAGIC {
                return Err(CodecError::Malformed("bad WAL header magic"));
            }
            let header_id = c.u64()?;
            if header_id != log_id {
                return Err(CodecError::Malformed("header log id does not match its file"));
            }
            LogRecord::Header {
                log_id: header_id,
                prev_log_id: c.u64()?,
                prev_end: c.u64()?,
            }
        }
        NewLog => LogRecord::NewLog {
            next_log_id: c.u64()?,
        },
        DeleteLog => LogRecord::DeleteLog {
            seq: c.u64()?,
            overflow_log_id: c.u32()?,
        },
        Commit => LogRecord::Commit {
            txn: c.u64()?,
            seq: c.u64()?,
        },
        Abort => LogRecord::Abort {
            txn: c.u64()?,
            seq: c.u64()?,
        },
        Insert | InsertLinked | Update | Delete | DeleteLinked => {
            let txn = c.u64()?;
            let seq = c.u64()?;
            let table = c.u32()?;
            let record = c.u64()?;
            let free_link = match kind {
                InsertLinked | DeleteLinked => Some(c.u64()?),
                _ => None,
            };
            let payload = match c.u8()? {
                PAYLOAD_INLINE => {
                    let len = c.u32()? as usize;
                    Payload::Inline(c.take(len)?.to_vec())
                }
                _ => Payload::Extended(c.address()?),
            };
            let change = RowChange {
                txn,
                seq,
                table,
                record,
                free_link,
                payload,
            };
            match kind {
                Insert | InsertLinked => LogRecord::Insert(change),
                Update => LogRecord::Update(change),
                _ => LogRecord::Delete(change),
            }
        }
        RowAdded | RowFreed => {
            let r = RowRef {
                txn: c.u64()?,
                seq: c.u64()?,
                table: c.u32()?,
                record: c.u64()?,
            };
            if kind == RowAdded {
                LogRecord::RowAdded(r)
            } else {
                LogRecord::RowFreed(r)
            }
        }
        RecordMoved => LogRecord::RecordMoved(RecordMove {
            seq: c.u64()?,
            table: c.u32()?,
            record: c.u64()?,
            from: c.address()?,
            to: c.address()?,
        }),
        NoOp => LogRecord::NoOp { fill: c.u16()? },
        EndMarker => LogRecord::EndMarker,
        Sync => LogRecord::Sync { seq: c.u64()? },
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_records() -> Vec<LogRecord> {
        let addr = OverflowAddress::new(3, 64, 9000);
        vec![
            LogRecord::Header {
                log_id: 7,
                prev_log_id: 6,
                prev_end: 4096,
            },
            LogRecord::NewLog { next_log_id: 8 },
            LogRecord::DeleteLog {
                seq: 12,
                overflow_log_id: 3,
            },
            LogRecord::Commit { txn: 4, seq: 13 },
            LogRecord::Abort { txn: 5, seq: 14 },
            LogRecord::Insert(RowChange::new(4, 1, 5, 10, Payload::Inline(b"foo".to_vec()))),
            LogRecord::Insert(
                RowChange::new(4, 2, 5, 11, Payload::Extended(addr)).with_free_link(99),
            ),
            LogRecord::Update(RowChange::new(0, 3, 5, 10, Payload::Inline(vec![]))),
            LogRecord::Delete(RowChange::new(4, 4, 5, 11, Payload::Inline(vec![])).with_free_link(10)),
            LogRecord::RowAdded(RowRef {
                txn: 4,
                seq: 5,
                table: 5,
                record: 12,
            }),
            LogRecord::RowFreed(RowRef {
                txn: 4,
                seq: 6,
                table: 5,
                record: 12,
            }),
            LogRecord::RecordMoved(RecordMove {
                seq: 7,
                table: 5,
                record: 11,
                from: addr,
                to: OverflowAddress::new(4, 64, 9000),
            }),
            LogRecord::NoOp { fill: 5 },
            LogRecord::EndMarker,
            LogRecord::Sync { seq: 8 },
        ]
    }

    #[test]
    fn test_every_kind_decodes_as_written() {
        for record in sample_records() {
            let bytes = record.encode(7).unwrap();
            assert_eq!(bytes.len(), record.encoded_len(), "{:?}", record.kind());
            match decode(&bytes, 7).unwrap() {
                Decoded::Record { record: got, len } => {
                    assert_eq!(got, record);
                    assert_eq!(len, bytes.len());
                }
                Decoded::Unwritten => panic!("decoded {:?} as unwritten", record.kind()),
            }
        }
    }

    #[test]
    fn test_zero_kind_is_unwritten() {
        assert_eq!(decode(&[0u8; 32], 1).unwrap(), Decoded::Unwritten);
    }

    #[test]
    fn test_truncated_record_is_incomplete() {
        let record = LogRecord::Insert(RowChange::new(1, 1, 5, 10, Payload::Inline(vec![7; 100])));
        let bytes = record.encode(1).unwrap();
        for cut in [1, 3, 20, bytes.len() - 1] {
            let err = decode(&bytes[..cut], 1).unwrap_err();
            assert!(err.is_incomplete(), "cut {} gave {:?}", cut, err);
        }
    }

    #[test]
    fn test_corrupted_body_fails_checksum() {
        let record = LogRecord::Insert(RowChange::new(1, 1, 5, 10, Payload::Inline(b"bar".to_vec())));
        let mut bytes = record.encode(1).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            decode(&bytes, 1),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_update_with_free_link_is_rejected() {
        let record = LogRecord::Update(RowChange::new(1, 1, 5, 10, Payload::Inline(vec![])).with_free_link(3));
        assert!(record.encode(1).is_err());
    }

    #[test]
    fn test_unknown_kind_is_reported() {
        assert_eq!(decode(&[200, 0, 0], 1), Err(CodecError::UnknownKind(200)));
    }

    proptest! {
        #[test]
        fn prop_record_never_valid_under_recycled_id(
            index in 0usize..15,
            old_id in 1u64..1_000_000,
            delta in 1u64..1_000_000,
        ) {
            prop_assume!(delta % 256 != 0);
            let record = sample_records()[index].clone();
            let record = match record {
                LogRecord::Header { prev_log_id, prev_end, .. } => LogRecord::Header { log_id: old_id, prev_log_id, prev_end },
                other => other,
            };
            let bytes = record.encode(old_id).unwrap();
            prop_assert!(decode(&bytes, old_id + delta).is_err());
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256), id in any::<u64>()) {
            let _ = decode(&bytes, id);
        }
    }
}
