//! Engine
//!
//! The service object that owns every component. `Engine::open` recovers and
//! starts the applier and compactor threads; `Engine::shutdown` drains and
//! stops them.
//!
//! # Checkpoints
//!
//! `checkpoint()` applies everything flushed so far, syncs the row layer and
//! the overflow logs, stores the applier's quiescent position and retires the
//! WAL files before it.

mod engine;
mod errors;

pub use engine::Engine;
pub use errors::{EngineError, EngineResult};
