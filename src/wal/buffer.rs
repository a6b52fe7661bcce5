use super::position::LogPosition;

/// In-memory image of a block-aligned span of one WAL file.
///
/// `data[0]` lives at file offset `base`, which is always block-aligned; the
/// first bytes may be a copy of an already flushed partial block.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    pub log_id: u64,
    pub base: u64,
    pub data: Vec<u8>,
    pub capacity: usize,
}

impl LogBuffer {
    pub fn new(log_id: u64, base: u64, capacity: usize) -> Self {
        Self {
            log_id,
            base,
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.log_id, self.end())
    }

    pub fn reset(&mut self, log_id: u64, base: u64) {
        self.log_id = log_id;
        self.base = base;
        self.data.clear();
    }

    /// Copy what this buffer holds of `[offset, offset + out.len())` into
    /// `out`, zero-filling past its end. Returns the index in `out` where the
    /// buffer's coverage starts, or `out.len()` if it covers nothing.
    pub fn overlay(&self, log_id: u64, offset: u64, out: &mut [u8]) -> usize {
        if self.log_id != log_id {
            return out.len();
        }
        let end = offset + out.len() as u64;
        let from = self.base.max(offset);
        if from >= end {
            return out.len();
        }
        let start = (from - offset) as usize;
        let src = (from - self.base) as usize;
        let n = self.data.len().saturating_sub(src).min(out.len() - start);
        out[start..start + n].copy_from_slice(&self.data[src..src + n]);
        out[start + n..].fill(0);
        start
    }
}

pub(crate) fn align_down(offset: u64, block_size: usize) -> u64 {
    offset - offset % block_size as u64
}
