use super::errors::{CodecError, CodecResult};

pub type TableId = u32;
pub type RowId = u64;
/// Transaction id assigned by the external transaction layer. `0` is autocommit.
pub type TxnId = u64;

pub const OVERFLOW_ADDRESS_LEN: usize = 16;

/// Location of an extended payload in an overflow log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverflowAddress {
    pub log_id: u32,
    /// Offset of the overflow record header within the file.
    pub offset: u64,
    /// Payload length, excluding the overflow record header.
    pub len: u32,
}

impl OverflowAddress {
    pub fn new(log_id: u32, offset: u64, len: u32) -> Self {
        Self {
            log_id,
            offset,
            len,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.log_id.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> CodecResult<Self> {
        if buf.len() < OVERFLOW_ADDRESS_LEN {
            return Err(CodecError::Malformed("truncated overflow address"));
        }
        Ok(Self {
            log_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offset: u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            len: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Row payload carried by a mutation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(Vec<u8>),
    /// Back-pointer to a payload too large to live in the WAL.
    Extended(OverflowAddress),
}

impl Payload {
    pub fn extended(&self) -> Option<OverflowAddress> {
        match self {
            Payload::Extended(addr) => Some(*addr),
            Payload::Inline(_) => None,
        }
    }

    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Payload::Inline(bytes) => 1 + 4 + bytes.len(),
            Payload::Extended(_) => 1 + OVERFLOW_ADDRESS_LEN,
        }
    }
}
