use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;

/// Logs waiting for the compactor, in signal order, without duplicates.
#[derive(Default)]
pub struct CompactionQueue {
    pending: Mutex<VecDeque<u32>>,
    cond: Condvar,
}

impl CompactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, log_id: u32) {
        let mut pending = self.pending.lock();
        if !pending.contains(&log_id) {
            pending.push_back(log_id);
        }
        self.cond.notify_all();
    }

    /// Next log to compact, or `None` once `cancel` fires.
    pub fn pop(&self, cancel: &CancellationToken, poll: Duration) -> Option<u32> {
        let mut pending = self.pending.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(id) = pending.pop_front() {
                return Some(id);
            }
            self.cond.wait_for(&mut pending, poll);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake a blocked `pop` so it notices cancellation.
    pub fn wake(&self) {
        let _pending = self.pending.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_deduplicates_and_keeps_order() {
        let queue = CompactionQueue::new();
        queue.push(3);
        queue.push(1);
        queue.push(3);
        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel, Duration::from_millis(1)), Some(3));
        assert_eq!(queue.pop(&cancel, Duration::from_millis(1)), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_returns_none_when_cancelled() {
        let queue = CompactionQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.pop(&cancel, Duration::from_millis(1)), None);
    }
}
