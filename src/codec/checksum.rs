//! Log-bound record checksums.

use crc32fast::Hasher;

pub const CRC_LEN_U8: usize = 1;
pub const CRC_LEN_U16: usize = 2;

/// Checksum of a record (kind byte plus body) written under `log_id`,
/// truncated to `width` bytes.
///
/// The CRC32 is folded down to the width, then the low bits of the log id
/// are added. For a fixed record, two log ids that differ modulo `2^(8*width)`
/// always produce different checksums.
pub fn wal_checksum(kind: u8, body: &[u8], log_id: u64, width: usize) -> u16 {
    let mut hasher = Hasher::new();
    hasher.update(&[kind]);
    hasher.update(body);
    let crc = hasher.finalize();
    let folded = (crc ^ (crc >> 16)) as u16;
    if width == CRC_LEN_U8 {
        let narrow = (folded ^ (folded >> 8)) as u8;
        narrow.wrapping_add(log_id as u8) as u16
    } else {
        folded.wrapping_add(log_id as u16)
    }
}
