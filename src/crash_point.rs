//! Crash point injection for durability testing
//!
//! A crash point is armed through the `DURALOG_CRASH_POINT` environment
//! variable. When the running code reaches the armed point the process is
//! terminated with `std::process::abort()`: no unwinding, no destructors,
//! no buffered writes flushed on the way out.
//!
//! ```bash
//! DURALOG_CRASH_POINT=wal_after_sync cargo test --test wal_durability
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn armed_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("DURALOG_CRASH_POINT").ok())
        .as_deref()
}

/// Returns true if `DURALOG_CRASH_POINT` names this point.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    armed_point().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if the named crash point is armed.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        tracing::error!(point = name, "crash point reached, aborting");
        std::process::abort();
    }
}

/// Every crash point the engine passes through.
pub mod points {
    pub const WAL_BEFORE_WRITE: &str = "wal_before_write";
    pub const WAL_AFTER_WRITE: &str = "wal_after_write";
    pub const WAL_AFTER_SYNC: &str = "wal_after_sync";
    pub const WAL_AFTER_ROLL: &str = "wal_after_roll";

    pub const OVERFLOW_AFTER_APPEND: &str = "overflow_after_append";
    pub const OVERFLOW_BEFORE_RETIRE: &str = "overflow_before_retire";

    pub const COMPACTOR_AFTER_COPY: &str = "compactor_after_copy";
    pub const COMPACTOR_AFTER_MOVE: &str = "compactor_after_move";

    pub const CHECKPOINT_BEFORE_RENAME: &str = "checkpoint_before_rename";

    pub fn all() -> &'static [&'static str] {
        &[
            WAL_BEFORE_WRITE,
            WAL_AFTER_WRITE,
            WAL_AFTER_SYNC,
            WAL_AFTER_ROLL,
            OVERFLOW_AFTER_APPEND,
            OVERFLOW_BEFORE_RETIRE,
            COMPACTOR_AFTER_COPY,
            COMPACTOR_AFTER_MOVE,
            CHECKPOINT_BEFORE_RENAME,
        ]
    }
}
