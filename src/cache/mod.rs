//! Log Block Cache
//!
//! Fixed-size, block-aligned cache shared by the read paths of the WAL and
//! the overflow logs.
//!
//! # Design
//!
//! - Blocks live in an owned arena of slots; a slot index is the only handle.
//! - Keys hash into segments, each with its own map lock and condvar.
//! - One allocator cursor sweeps the arena round-robin. A victim that is
//!   still busy is waited for, never skipped, so a claim completes in about
//!   one block read.
//! - A key is owned by at most one slot; racing loaders of the same key
//!   resolve at publish time and the loser hands its slot back.

mod block_cache;
mod errors;

pub use block_cache::{BlockCache, BlockKey, BlockState, Fetch, FetchMode, LogSpace};
pub use errors::{CacheError, CacheResult};
