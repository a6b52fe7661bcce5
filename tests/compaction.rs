//! Compaction Tests
//!
//! - A log whose garbage crosses the threshold is compacted and retired
//! - Surviving extended payloads stay readable and byte-identical
//! - A row changed while its payload is being moved keeps the newer image

mod common;

use std::time::Duration;

use common::{image, insert, inline, open_engine, test_config, update, wait_until};
use duralog::codec::{OverflowAddress, Payload};
use duralog::overflow::{LogState, OVERFLOW_RECORD_HEADER_LEN};
use duralog::rows::RowImage;
use tempfile::TempDir;

const TABLE: u32 = 1;
const PAYLOAD_LEN: usize = 1000;

fn payload(i: u64) -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|b| (b as u64 * 7 + i) as u8).collect()
}

fn extended_addr(img: Option<RowImage>) -> OverflowAddress {
    match img {
        Some(RowImage::Extended(addr)) => addr,
        other => panic!("expected an extended row, got {:?}", other),
    }
}

// =============================================================================
// Threshold-driven compaction
// =============================================================================

#[test]
fn test_garbage_log_is_compacted_and_recycled() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let (engine, rows) = open_engine(&config);

    let mut seq = 0u64;
    for i in 0..6u64 {
        let addr = engine.write_extended(TABLE, i, &payload(i)).unwrap();
        assert_eq!(addr.log_id, 1, "six records fit in the first log");
        seq += 1;
        engine
            .append(&insert(seq, TABLE, i, Payload::Extended(addr)), true)
            .unwrap();
    }
    engine.sync().unwrap();
    assert_eq!(engine.overflow().state_of(1), Some(LogState::HasSpace));

    // Replacing four of six payloads pushes log 1 over the threshold.
    for i in 0..4u64 {
        seq += 1;
        engine
            .append(&update(seq, TABLE, i, inline(b"small")), i == 3)
            .unwrap();
    }
    engine.sync().unwrap();

    let overflow = engine.overflow();
    assert!(
        wait_until(Duration::from_secs(10), || overflow.state_of(1).is_none()),
        "log 1 was never retired, state {:?}",
        overflow.state_of(1)
    );
    engine.sync().unwrap();

    for i in 0..4u64 {
        assert_eq!(image(&rows, TABLE, i), Some(RowImage::Inline(b"small".to_vec())));
    }
    for i in 4..6u64 {
        let addr = extended_addr(image(&rows, TABLE, i));
        assert_ne!(addr.log_id, 1, "row {} still points into the retired log", i);
        assert_eq!(engine.read_extended(addr).unwrap(), payload(i));
    }

    let stats = engine.stats();
    assert!(stats.compaction_passes >= 1);
    assert_eq!(stats.overflow_logs_recycled, 1);
    let recycled = overflow.info(16).expect("log 1 recycled under the highest free id");
    assert_eq!(recycled.state, LogState::HasSpace);
    assert_eq!(recycled.end, 64);
    engine.shutdown().unwrap();

    // The moves are in the WAL, so a restart sees the same rows.
    let (engine, rows) = open_engine(&config);
    for i in 4..6u64 {
        let addr = extended_addr(image(&rows, TABLE, i));
        assert_eq!(engine.read_extended(addr).unwrap(), payload(i));
    }
    engine.shutdown().unwrap();
}

#[test]
fn test_log_below_threshold_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let (engine, rows) = open_engine(&test_config(dir.path()));

    for i in 0..6u64 {
        let addr = engine.write_extended(TABLE, i, &payload(i)).unwrap();
        engine
            .append(&insert(i + 1, TABLE, i, Payload::Extended(addr)), true)
            .unwrap();
    }
    engine.append(&update(7, TABLE, 0, inline(b"small")), true).unwrap();
    engine.sync().unwrap();

    let info = engine.overflow().info(1).unwrap();
    assert_eq!(info.state, LogState::HasSpace);
    assert_eq!(info.garbage, (OVERFLOW_RECORD_HEADER_LEN + PAYLOAD_LEN) as u64);
    assert_eq!(engine.stats().compaction_passes, 0);
    for i in 1..6u64 {
        let addr = extended_addr(image(&rows, TABLE, i));
        assert_eq!(addr.log_id, 1);
    }
    engine.shutdown().unwrap();
}

// =============================================================================
// Unreferenced payloads
// =============================================================================

#[test]
fn test_released_payload_makes_log_all_garbage() {
    let dir = TempDir::new().unwrap();
    let (engine, _rows) = open_engine(&test_config(dir.path()));

    let addr = engine.write_extended(TABLE, 1, &payload(1)).unwrap();
    engine.release_extended(addr).unwrap();

    let overflow = engine.overflow();
    assert!(wait_until(Duration::from_secs(10), || overflow.state_of(1).is_none()));
    assert!(engine.read_extended(addr).is_err(), "retired log must not serve reads");
    assert_eq!(engine.stats().compaction_passes, 0, "nothing live to copy");
    engine.shutdown().unwrap();
}

#[test]
fn test_explicit_delete_log_keeps_live_log() {
    let dir = TempDir::new().unwrap();
    let (engine, rows) = open_engine(&test_config(dir.path()));

    let addr = engine.write_extended(TABLE, 1, &payload(1)).unwrap();
    engine
        .append(&insert(1, TABLE, 1, Payload::Extended(addr)), true)
        .unwrap();
    engine.delete_log(addr.log_id).unwrap();
    engine.sync().unwrap();

    assert_eq!(engine.overflow().state_of(1), Some(LogState::HasSpace));
    let addr = extended_addr(image(&rows, TABLE, 1));
    assert_eq!(engine.read_extended(addr).unwrap(), payload(1));
    engine.shutdown().unwrap();
}
