use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::codec::TableId;

/// Per-table exclusion shared by the applier and the compactor.
///
/// The compactor re-validates a row's back-pointer and publishes its move
/// under the table's lock, so the applier can never interleave a change to
/// the same row between the check and the move.
#[derive(Default)]
pub struct TableLocks {
    tables: Mutex<HashMap<TableId, Arc<Mutex<()>>>>,
}

/// Held table lock. Keeps the table's mutex alive while held.
pub struct TableGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, table: TableId) -> TableGuard {
        let mutex = Arc::clone(self.tables.lock().entry(table).or_default());
        TableGuard {
            _guard: mutex.lock_arc(),
        }
    }

    #[cfg(test)]
    fn is_locked(&self, table: TableId) -> bool {
        self.tables
            .lock()
            .get(&table)
            .map(|m| m.is_locked())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_same_table_only() {
        let locks = TableLocks::new();
        let guard = locks.lock(5);
        assert!(locks.is_locked(5));
        assert!(!locks.is_locked(6));
        drop(guard);
        assert!(!locks.is_locked(5));
    }
}
