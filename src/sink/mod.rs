//! Batch sinks.

mod jsonl;

pub use jsonl::*;
