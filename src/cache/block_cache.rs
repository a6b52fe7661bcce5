use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use super::errors::{CacheError, CacheResult};
use crate::fileio;
use crate::observability::Metrics;

/// Id namespace a cached block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSpace {
    Wal,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub space: LogSpace,
    pub log_id: u64,
    /// Block-aligned file offset.
    pub address: u64,
}

impl BlockKey {
    pub fn new(space: LogSpace, log_id: u64, address: u64) -> Self {
        Self {
            space,
            log_id,
            address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Reading,
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Load from the file on a miss.
    ReadThrough,
    /// Materialize a zeroed block on a miss without touching the file.
    BlankInit,
    /// Never touch the file and never allocate; a miss is reported.
    ProbeOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    Hit,
    Loaded,
    Miss,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    slot: usize,
    state: BlockState,
}

struct Segment {
    map: Mutex<HashMap<BlockKey, Entry>>,
    cond: Condvar,
}

struct Allocator {
    cursor: usize,
    /// Key each slot is reserved for or holds. `None` is a Free slot.
    owners: Vec<Option<BlockKey>>,
}

impl Allocator {
    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.owners.len();
    }
}

pub struct BlockCache {
    block_size: usize,
    segments: Vec<Segment>,
    blocks: Vec<RwLock<Box<[u8]>>>,
    alloc: Mutex<Allocator>,
    metrics: Arc<Metrics>,
}

impl BlockCache {
    pub fn new(block_size: usize, blocks: usize, segments: usize, metrics: Arc<Metrics>) -> Self {
        let segments = segments.clamp(1, blocks.max(1));
        Self {
            block_size,
            segments: (0..segments)
                .map(|_| Segment {
                    map: Mutex::new(HashMap::new()),
                    cond: Condvar::new(),
                })
                .collect(),
            blocks: (0..blocks)
                .map(|_| RwLock::new(vec![0u8; block_size].into_boxed_slice()))
                .collect(),
            alloc: Mutex::new(Allocator {
                cursor: 0,
                owners: vec![None; blocks],
            }),
            metrics,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity_bytes(&self) -> u64 {
        (self.blocks.len() * self.block_size) as u64
    }

    /// Number of slots currently reserved or holding a block.
    pub fn resident_blocks(&self) -> usize {
        self.alloc.lock().owners.iter().filter(|o| o.is_some()).count()
    }

    pub fn state_of(&self, key: &BlockKey) -> BlockState {
        self.segment(key)
            .map
            .lock()
            .get(key)
            .map(|e| e.state)
            .unwrap_or(BlockState::Free)
    }

    fn segment(&self, key: &BlockKey) -> &Segment {
        let block = key.address / self.block_size as u64;
        let space = match key.space {
            LogSpace::Wal => 0,
            LogSpace::Overflow => 0x5bd1_e995,
        };
        let h = key
            .log_id
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(block.wrapping_mul(0xC2B2_AE3D_27D4_EB4F))
            ^ space;
        &self.segments[(h % self.segments.len() as u64) as usize]
    }

    /// Copy the block for `key` into `out` (one block long).
    pub fn fetch(
        &self,
        file: &File,
        key: BlockKey,
        mode: FetchMode,
        out: &mut [u8],
    ) -> CacheResult<Fetch> {
        debug_assert_eq!(out.len(), self.block_size);
        let seg = self.segment(&key);
        loop {
            {
                let mut map = seg.map.lock();
                loop {
                    match map.get(&key).copied() {
                        Some(Entry {
                            slot,
                            state: BlockState::Clean,
                        }) => {
                            out.copy_from_slice(&self.blocks[slot].read());
                            self.metrics.cache_hits.incr();
                            return Ok(Fetch::Hit);
                        }
                        Some(_) => seg.cond.wait(&mut map),
                        None => break,
                    }
                }
            }

            self.metrics.cache_misses.incr();
            if mode == FetchMode::ProbeOnly {
                return Ok(Fetch::Miss);
            }

            let slot = self.claim_slot(key);
            if !self.publish(seg, key, slot) {
                self.release_slot(slot, key);
                continue;
            }

            let filled = {
                let mut data = self.blocks[slot].write();
                let res = match mode {
                    FetchMode::ReadThrough => read_block(file, key.address, &mut data),
                    _ => {
                        data.fill(0);
                        Ok(())
                    }
                };
                if res.is_ok() {
                    out.copy_from_slice(&data);
                }
                res
            };
            return match filled {
                Ok(()) => {
                    self.mark_clean(seg, key);
                    Ok(Fetch::Loaded)
                }
                Err(source) => {
                    seg.map.lock().remove(&key);
                    self.release_slot(slot, key);
                    Err(CacheError::Read {
                        space: key.space,
                        log_id: key.log_id,
                        address: key.address,
                        source,
                    })
                }
            };
        }
    }

    /// Publish freshly written bytes for a block. Bytes past `data` are zero.
    pub fn put(&self, key: BlockKey, data: &[u8]) {
        debug_assert!(data.len() <= self.block_size);
        let seg = self.segment(&key);
        loop {
            {
                let mut map = seg.map.lock();
                loop {
                    match map.get(&key).copied() {
                        Some(Entry {
                            slot,
                            state: BlockState::Clean,
                        }) => {
                            copy_padded(&mut self.blocks[slot].write(), data);
                            return;
                        }
                        Some(_) => seg.cond.wait(&mut map),
                        None => break,
                    }
                }
            }

            let slot = self.claim_slot(key);
            if !self.publish(seg, key, slot) {
                self.release_slot(slot, key);
                continue;
            }
            copy_padded(&mut self.blocks[slot].write(), data);
            self.mark_clean(seg, key);
            return;
        }
    }

    /// Overwrite part of a resident block. Absent blocks are left alone.
    pub fn patch(&self, key: BlockKey, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.block_size);
        let seg = self.segment(&key);
        let mut map = seg.map.lock();
        loop {
            match map.get(&key).copied() {
                Some(Entry {
                    slot,
                    state: BlockState::Clean,
                }) => {
                    self.blocks[slot].write()[offset..offset + bytes.len()].copy_from_slice(bytes);
                    return;
                }
                Some(_) => seg.cond.wait(&mut map),
                None => return,
            }
        }
    }

    /// Drop every clean block of a log that is being deleted or recycled.
    pub fn invalidate_log(&self, space: LogSpace, log_id: u64) {
        let mut released = Vec::new();
        for seg in &self.segments {
            seg.map.lock().retain(|key, entry| {
                let drop_it = key.space == space
                    && key.log_id == log_id
                    && entry.state == BlockState::Clean;
                if drop_it {
                    released.push((entry.slot, *key));
                }
                !drop_it
            });
        }
        for (slot, key) in released {
            self.release_slot(slot, key);
        }
    }

    /// Read `out.len()` bytes at `offset`, block by block through the cache.
    ///
    /// With `ProbeOnly`, blocks that are not resident are read straight from
    /// the file without being cached.
    pub fn read_range(
        &self,
        file: &File,
        space: LogSpace,
        log_id: u64,
        offset: u64,
        out: &mut [u8],
        mode: FetchMode,
    ) -> CacheResult<()> {
        let bs = self.block_size as u64;
        let mut scratch = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u64;
            let base = pos - pos % bs;
            let within = (pos - base) as usize;
            let n = (self.block_size - within).min(out.len() - done);
            let key = BlockKey::new(space, log_id, base);
            match self.fetch(file, key, mode, &mut scratch)? {
                Fetch::Miss => {
                    let dst = &mut out[done..done + n];
                    let got = fileio::read_at(file, dst, pos).map_err(|source| CacheError::Read {
                        space,
                        log_id,
                        address: base,
                        source,
                    })?;
                    dst[got..].fill(0);
                }
                _ => out[done..done + n].copy_from_slice(&scratch[within..within + n]),
            }
            done += n;
        }
        Ok(())
    }

    /// Reserve a slot for `key`, evicting the block under the cursor.
    fn claim_slot(&self, key: BlockKey) -> usize {
        loop {
            let mut alloc = self.alloc.lock();
            let idx = alloc.cursor;
            let Some(victim) = alloc.owners[idx] else {
                alloc.owners[idx] = Some(key);
                alloc.advance();
                return idx;
            };

            let seg = self.segment(&victim);
            let mut map = seg.map.lock();
            if let Some(entry) = map.get(&victim).copied() {
                if entry.slot == idx && entry.state == BlockState::Clean {
                    map.remove(&victim);
                    alloc.owners[idx] = Some(key);
                    alloc.advance();
                    self.metrics.cache_evictions.incr();
                    return idx;
                }
            }

            // The victim is being loaded or its claim is still in flight.
            // Wait for its owner rather than moving the cursor past it.
            drop(alloc);
            seg.cond.wait(&mut map);
        }
    }

    fn publish(&self, seg: &Segment, key: BlockKey, slot: usize) -> bool {
        let mut map = seg.map.lock();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(
            key,
            Entry {
                slot,
                state: BlockState::Reading,
            },
        );
        seg.cond.notify_all();
        true
    }

    fn mark_clean(&self, seg: &Segment, key: BlockKey) {
        let mut map = seg.map.lock();
        if let Some(entry) = map.get_mut(&key) {
            entry.state = BlockState::Clean;
        }
        seg.cond.notify_all();
    }

    fn release_slot(&self, slot: usize, key: BlockKey) {
        {
            let mut alloc = self.alloc.lock();
            if alloc.owners[slot] == Some(key) {
                alloc.owners[slot] = None;
            }
        }
        // Taking the map lock orders this wake-up after any evictor that
        // already decided to wait on the slot.
        let seg = self.segment(&key);
        let _map = seg.map.lock();
        seg.cond.notify_all();
    }
}

fn read_block(file: &File, address: u64, data: &mut [u8]) -> std::io::Result<()> {
    let n = fileio::read_at(file, data, address)?;
    data[n..].fill(0);
    Ok(())
}

fn copy_padded(block: &mut [u8], data: &[u8]) {
    block[..data.len()].copy_from_slice(data);
    block[data.len()..].fill(0);
}
