//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use duralog::codec::{LogRecord, Payload, RowChange, RowId, TableId};
use duralog::rows::{MemoryRowStore, RowImage, RowStore};
use duralog::{Engine, EngineConfig};

/// Small sizes so rolls, spills and compaction happen within a test.
pub fn test_config(data_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(data_dir);
    config.block_size = 512;
    config.cache_blocks = 64;
    config.cache_segments = 4;
    config.inline_payload_limit = 256;
    config.wal_buffer_size = 4096;
    config.wal_log_size = 64 * 1024;
    config.overflow_log_size = 8192;
    config.max_overflow_logs = 16;
    config.apply_interval_ms = 5;
    config.retry_backoff_ms = 10;
    config.max_commit_delay_us = 500;
    config
}

pub fn open_engine(config: &EngineConfig) -> (Engine, Arc<MemoryRowStore>) {
    let rows = Arc::new(MemoryRowStore::new());
    let engine = Engine::open(config.clone(), Arc::clone(&rows) as Arc<dyn RowStore>)
        .expect("Failed to open engine");
    (engine, rows)
}

pub fn insert(seq: u64, table: TableId, record: RowId, payload: Payload) -> LogRecord {
    LogRecord::Insert(RowChange::new(0, seq, table, record, payload))
}

pub fn update(seq: u64, table: TableId, record: RowId, payload: Payload) -> LogRecord {
    LogRecord::Update(RowChange::new(0, seq, table, record, payload))
}

pub fn inline(bytes: &[u8]) -> Payload {
    Payload::Inline(bytes.to_vec())
}

pub fn image(rows: &MemoryRowStore, table: TableId, record: RowId) -> Option<RowImage> {
    rows.read(table, record)
        .expect("row read failed")
        .map(|bytes| RowImage::decode(&bytes).expect("bad row image"))
}

/// Copy a data directory as it is on disk right now. Recovering from the
/// copy is recovering from a crash at this instant.
pub fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).expect("Failed to create copy target");
    for entry in fs::read_dir(from).expect("Failed to list data dir") {
        let entry = entry.expect("Failed to read dir entry");
        let target = to.join(entry.file_name());
        if entry.file_type().expect("Failed to stat entry").is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).expect("Failed to copy file");
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
