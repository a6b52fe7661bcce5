use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::codec::TableId;

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Highest operation sequence applied per table.
///
/// The applier advances a table's watermark after every applied mutation;
/// the compactor waits on it before a vacated overflow log may be retired.
#[derive(Default)]
pub struct Watermarks {
    applied: Mutex<HashMap<TableId, u64>>,
    cond: Condvar,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never moves a watermark backwards.
    pub fn advance(&self, table: TableId, seq: u64) {
        let mut applied = self.applied.lock();
        let mark = applied.entry(table).or_insert(0);
        if seq > *mark {
            *mark = seq;
            self.cond.notify_all();
        }
    }

    pub fn get(&self, table: TableId) -> u64 {
        self.applied.lock().get(&table).copied().unwrap_or(0)
    }

    /// Block until `table` has applied `seq`. Returns false if cancelled first.
    pub fn wait_for(&self, table: TableId, seq: u64, cancel: &CancellationToken) -> bool {
        let mut applied = self.applied.lock();
        loop {
            if applied.get(&table).copied().unwrap_or(0) >= seq {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
            self.cond.wait_for(&mut applied, WAIT_SLICE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_advance_is_monotonic() {
        let marks = Watermarks::new();
        marks.advance(5, 10);
        marks.advance(5, 7);
        assert_eq!(marks.get(5), 10);
        assert_eq!(marks.get(6), 0);
    }

    #[test]
    fn test_wait_for_wakes_on_advance() {
        let marks = Arc::new(Watermarks::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let marks = Arc::clone(&marks);
            let cancel = cancel.clone();
            thread::spawn(move || marks.wait_for(5, 3, &cancel))
        };
        marks.advance(5, 2);
        marks.advance(5, 3);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_for_gives_up_when_cancelled() {
        let marks = Watermarks::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!marks.wait_for(5, 1, &cancel));
    }
}
