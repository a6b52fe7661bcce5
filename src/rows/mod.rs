//! Row layer boundary
//!
//! The engine does not own a row format. It writes row images through the
//! `RowStore` trait supplied by the embedding database and reads them back
//! when it has to know where a row's extended payload lives.
//!
//! A row image is a tag byte followed by either the inline bytes or an
//! encoded `OverflowAddress`.

mod errors;
mod image;
mod locks;
mod memory;

pub use errors::{RowError, RowResult};
pub use image::RowImage;
pub use locks::{TableGuard, TableLocks};
pub use memory::MemoryRowStore;

use crate::codec::{RowId, TableId};

/// Row storage consumed by the engine.
///
/// Implementations must tolerate replay: writing the same image twice or
/// removing an absent row is not an error.
pub trait RowStore: Send + Sync {
    fn read(&self, table: TableId, record: RowId) -> RowResult<Option<Vec<u8>>>;

    fn write(&self, table: TableId, record: RowId, image: &[u8]) -> RowResult<()>;

    fn remove(&self, table: TableId, record: RowId) -> RowResult<()>;

    /// A row slot was allocated.
    fn row_added(&self, _table: TableId, _record: RowId) -> RowResult<()> {
        Ok(())
    }

    /// A row slot was released.
    fn row_freed(&self, _table: TableId, _record: RowId) -> RowResult<()> {
        Ok(())
    }

    /// Make every applied change durable. Called before a checkpoint.
    fn sync(&self) -> RowResult<()> {
        Ok(())
    }
}
