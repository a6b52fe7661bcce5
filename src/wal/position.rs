use std::fmt;

use serde::{Deserialize, Serialize};

/// Global WAL position. Orders by log id, then by offset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub log_id: u64,
    pub offset: u64,
}

impl LogPosition {
    pub const fn new(log_id: u64, offset: u64) -> Self {
        Self { log_id, offset }
    }

    /// Approximate number of log bytes from `self` up to `later`, assuming
    /// every log in between is full.
    pub fn bytes_until(&self, later: LogPosition, log_size: u64) -> u64 {
        if later <= *self {
            return 0;
        }
        if later.log_id == self.log_id {
            return later.offset - self.offset;
        }
        let whole_logs = later.log_id - self.log_id - 1;
        log_size.saturating_sub(self.offset) + whole_logs * log_size + later.offset
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_log_then_offset() {
        assert!(LogPosition::new(1, 900) < LogPosition::new(2, 0));
        assert!(LogPosition::new(2, 10) < LogPosition::new(2, 11));
    }

    #[test]
    fn test_bytes_until_spans_logs() {
        let a = LogPosition::new(1, 600);
        assert_eq!(a.bytes_until(LogPosition::new(1, 700), 1000), 100);
        assert_eq!(a.bytes_until(LogPosition::new(3, 50), 1000), 400 + 1000 + 50);
        assert_eq!(a.bytes_until(LogPosition::new(1, 100), 1000), 0);
    }
}
