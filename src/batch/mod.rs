//! Resumable batch engine.
//!
//! Provides:
//! - `DedupLedger`: Per-run set of seen identity keys
//! - `RetryPolicy`: Bounded exponential backoff dispatching on `ErrorKind`
//! - `ProgressUpdate` / `RunProgress`: Percentage and ETA from counters
//! - `ItemFeed`: Pull-based item sources with optional bookmarks
//! - `BatchRunner`: `process` and `resume` over a feed and a sink

mod dedup;
mod feed;
mod progress;
mod retry;
mod runner;

pub use dedup::*;
pub use feed::*;
pub use progress::*;
pub use retry::*;
pub use runner::*;
