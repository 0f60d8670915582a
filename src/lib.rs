//! storescout - Resumable store-location acquisition from unreliable web sources.
//!
//! ## Architecture
//!
//! - **Sources**: Paginated adapters (REWE, denn's, local JSONL) exposed as item feeds
//! - **BatchRunner**: Pulls unique items in fixed-size batches into a sink,
//!   checkpointing after every batch
//! - **CheckpointStore**: SQLite run table; the recovery point for `resume`
//!
//! ## Guarantees
//!
//! - At-least-once delivery per batch; a batch is credited only after its checkpoint
//! - Duplicate items within a run never reach the sink
//! - "Could not check" (`Unknown`) is never reported as "checked and negative"
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff)

pub mod batch;
pub mod checkpoint;
pub mod client;
pub mod models;
pub mod sink;
pub mod source;

// Re-exports for convenience
pub use batch::{BatchRunner, BatchSink, DedupLedger, ItemFeed, RetryPolicy, RunOptions};
pub use checkpoint::{CheckpointStore, Run, RunStatus};
pub use client::{HttpClient, Pacer};
pub use models::{Availability, BatchError, Config, ErrorKind, Item, Result, Store};
pub use sink::JsonlSink;
pub use source::{SourceAdapter, SourceFeed, SourceId, build_feed};
