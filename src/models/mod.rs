//! Core data models for storescout.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants tagged with a retry disposition

mod config;
mod error;
mod store;

pub use config::*;
pub use error::*;
pub use store::*;
