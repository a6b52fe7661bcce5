//! Recovery
//!
//! # Startup sequence (strict order)
//!
//! 1. Create the WAL and overflow directories
//! 2. Scan the overflow logs (gap-tolerant)
//! 3. Load the checkpoint, if any
//! 4. Replay the WAL from it through the applier's dispatcher (strict)
//! 5. Discard transactions left open and run held-back overflow frees
//! 6. Open the writer on a fresh log linked to the replay end
//!
//! Steps 1, 2 and 6 belong to the engine; this module is the replay.

mod replay;

pub use replay::{ReplayStats, WalReplayer};
