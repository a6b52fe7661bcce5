//! Overflow Log Recycling Tests
//!
//! A retired overflow file is renamed under a fresh id instead of deleted.
//! Its old records must never verify under the new id, including when the
//! file comes back to an id it held before.

mod common;

use std::time::Duration;

use common::{open_engine, test_config, wait_until};
use duralog::codec::OverflowAddress;
use duralog::overflow::LogState;
use tempfile::TempDir;

fn retire_first_log(engine: &duralog::Engine) -> OverflowAddress {
    let addr = engine.write_extended(2, 9, &[0xEE; 700]).unwrap();
    assert_eq!(addr.log_id, 1);
    engine.release_extended(addr).unwrap();
    let overflow = engine.overflow();
    assert!(
        wait_until(Duration::from_secs(10), || overflow.state_of(1).is_none()),
        "log 1 was never retired"
    );
    addr
}

fn release_and_wait_retired(engine: &duralog::Engine, addrs: &[OverflowAddress]) {
    let log_id = addrs[0].log_id;
    for addr in addrs {
        engine.release_extended(*addr).unwrap();
    }
    let overflow = engine.overflow();
    assert!(
        wait_until(Duration::from_secs(10), || overflow.state_of(log_id).is_none()),
        "log {} was never retired",
        log_id
    );
}

// =============================================================================
// Recycled identity
// =============================================================================

#[test]
fn test_old_record_does_not_verify_under_new_id() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let (engine, _rows) = open_engine(&config);

    let old = retire_first_log(&engine);
    assert!(!engine.overflow().path_for(1).exists());
    assert!(engine.overflow().path_for(16).exists());
    assert_eq!(engine.stats().overflow_logs_recycled, 1);

    // Same bytes, same offset, new id: the checksum no longer matches.
    let aliased = OverflowAddress::new(16, old.offset, old.len);
    assert!(engine.read_extended(aliased).is_err());
    engine.shutdown().unwrap();
}

#[test]
fn test_recovery_scan_of_recycled_log_finds_it_empty() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    {
        let (engine, _rows) = open_engine(&config);
        retire_first_log(&engine);
        engine.shutdown().unwrap();
    }

    let (engine, _rows) = open_engine(&config);
    let info = engine.overflow().info(16).expect("recycled log recovered");
    assert_eq!(info.state, LogState::HasSpace);
    assert_eq!(info.end, 64, "stale records must not count as written");
    assert_eq!(info.garbage, 0);
    engine.shutdown().unwrap();
}

#[test]
fn test_recycled_log_is_written_from_its_start() {
    let dir = TempDir::new().unwrap();
    let (engine, _rows) = open_engine(&test_config(dir.path()));
    retire_first_log(&engine);

    let addr = engine.write_extended(2, 10, b"fresh payload").unwrap();
    assert_eq!(addr.log_id, 16, "the recycled log is the only writable one");
    assert_eq!(addr.offset, 64);
    assert_eq!(engine.read_extended(addr).unwrap(), b"fresh payload".to_vec());
    engine.release_extended(addr).unwrap();
    engine.shutdown().unwrap();
}

// =============================================================================
// Returning ids
// =============================================================================

/// With two ids the same file alternates 1 -> 2 -> 1 -> 2. A record from its
/// first life as 2 still sits on disk, untouched by the life as 1.
#[test]
fn test_file_returning_to_former_id_drops_its_old_records() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.max_overflow_logs = 2;
    let stale = {
        let (engine, _rows) = open_engine(&config);
        let first = engine.write_extended(2, 1, &[0x11; 700]).unwrap();
        assert_eq!(first.log_id, 1);
        release_and_wait_retired(&engine, &[first]);
        assert_eq!(engine.overflow().log_ids(), vec![2]);

        let small = engine.write_extended(2, 2, &[0x22; 50]).unwrap();
        let stale = engine.write_extended(2, 3, &[0x33; 700]).unwrap();
        assert_eq!((small.log_id, stale.log_id), (2, 2));
        release_and_wait_retired(&engine, &[small, stale]);
        assert_eq!(engine.overflow().log_ids(), vec![1]);

        let short = engine.write_extended(2, 4, &[0x44; 20]).unwrap();
        assert_eq!(short.log_id, 1);
        assert!(short.offset + 45 <= stale.offset, "the middle life must not reach it");
        release_and_wait_retired(&engine, &[short]);
        assert_eq!(engine.overflow().log_ids(), vec![2]);
        assert_eq!(engine.stats().overflow_logs_recycled, 3);

        assert!(engine.read_extended(stale).is_err(), "record of an earlier life verified");
        let info = engine.overflow().info(2).unwrap();
        assert_eq!((info.state, info.end, info.garbage), (LogState::HasSpace, 64, 0));
        engine.shutdown().unwrap();
        stale
    };

    let (engine, _rows) = open_engine(&config);
    let info = engine.overflow().info(2).expect("recycled log recovered");
    assert_eq!(info.state, LogState::HasSpace);
    assert_eq!(info.end, 64, "records of an earlier life counted as written");
    assert_eq!(info.garbage, 0);
    assert!(engine.read_extended(stale).is_err());

    let fresh = engine.write_extended(2, 5, b"fourth life").unwrap();
    assert_eq!((fresh.log_id, fresh.offset), (2, 64));
    assert_eq!(engine.read_extended(fresh).unwrap(), b"fourth life".to_vec());
    engine.release_extended(fresh).unwrap();
    engine.shutdown().unwrap();
}

// =============================================================================
// Recycling disabled
// =============================================================================

#[test]
fn test_retired_log_is_deleted_when_recycling_is_off() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.recycle_overflow_logs = false;
    let (engine, _rows) = open_engine(&config);

    retire_first_log(&engine);
    assert!(engine.overflow().log_ids().is_empty());
    assert_eq!(engine.stats().overflow_logs_deleted, 1);
    assert_eq!(engine.stats().overflow_logs_recycled, 0);
    engine.shutdown().unwrap();
}
