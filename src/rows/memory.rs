use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;

use super::errors::RowResult;
use super::RowStore;
use crate::codec::{RowId, TableId};

/// Row store kept entirely in memory.
#[derive(Default)]
pub struct MemoryRowStore {
    rows: RwLock<HashMap<(TableId, RowId), Vec<u8>>>,
    allocated: RwLock<HashSet<(TableId, RowId)>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn is_allocated(&self, table: TableId, record: RowId) -> bool {
        self.allocated.read().contains(&(table, record))
    }

    /// Every row, ordered by key. Used to compare states.
    pub fn snapshot(&self) -> BTreeMap<(TableId, RowId), Vec<u8>> {
        self.rows
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

impl RowStore for MemoryRowStore {
    fn read(&self, table: TableId, record: RowId) -> RowResult<Option<Vec<u8>>> {
        Ok(self.rows.read().get(&(table, record)).cloned())
    }

    fn write(&self, table: TableId, record: RowId, image: &[u8]) -> RowResult<()> {
        self.rows.write().insert((table, record), image.to_vec());
        Ok(())
    }

    fn remove(&self, table: TableId, record: RowId) -> RowResult<()> {
        self.rows.write().remove(&(table, record));
        Ok(())
    }

    fn row_added(&self, table: TableId, record: RowId) -> RowResult<()> {
        self.allocated.write().insert((table, record));
        Ok(())
    }

    fn row_freed(&self, table: TableId, record: RowId) -> RowResult<()> {
        self.allocated.write().remove(&(table, record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_remove() {
        let store = MemoryRowStore::new();
        store.write(5, 10, b"foo").unwrap();
        assert_eq!(store.read(5, 10).unwrap(), Some(b"foo".to_vec()));
        assert_eq!(store.read(5, 11).unwrap(), None);

        store.remove(5, 10).unwrap();
        store.remove(5, 10).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_slot_tracking() {
        let store = MemoryRowStore::new();
        store.row_added(1, 2).unwrap();
        assert!(store.is_allocated(1, 2));
        store.row_freed(1, 2).unwrap();
        assert!(!store.is_allocated(1, 2));
    }
}
