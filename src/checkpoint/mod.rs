//! Checkpoint module for resumable runs.
//!
//! Provides:
//! - `Run`: Durable record of one acquisition attempt
//! - `Checkpoint`: Per-batch progress snapshot
//! - `CheckpointStore`: SQLite persistence of runs and checkpoints

mod run;
mod store;

pub use run::*;
pub use store::*;
