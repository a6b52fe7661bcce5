use std::sync::atomic::{AtomicU64, Ordering};

/// Source of operation sequence numbers.
///
/// Seeded after replay with the highest sequence found in the log, so
/// numbers keep increasing across restarts.
#[derive(Debug, Default)]
pub struct OpSequence(AtomicU64);

impl OpSequence {
    pub fn new(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continues_after_seed() {
        let seq = OpSequence::new(41);
        assert_eq!(seq.next(), 42);
        assert_eq!(seq.next(), 43);
        assert_eq!(seq.last(), 43);
    }
}
