//! Progress reporting: percentage and ETA as pure functions of run counters.
//!
//! Epistemic foundation:
//! - K_i: percentage = (processed + failed) / total * 100, two decimals, capped at 100
//! - B_i: total may be unknown → percentage omitted, never guessed
//! - I^B: ETA assumes the observed rate holds

use crate::checkpoint::{Run, RunStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Payload handed to the progress callback after each checkpointed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub batch_index: i64,
    pub processed: u64,
    pub failed: u64,
    pub total: Option<u64>,
    pub percentage: Option<f64>,
}

impl ProgressUpdate {
    pub fn new(batch_index: i64, processed: u64, failed: u64, total: Option<u64>) -> Self {
        Self {
            batch_index,
            processed,
            failed,
            total,
            percentage: percentage(processed + failed, total),
        }
    }
}

/// Share of `total` already handled, rounded to two decimals.
pub fn percentage(handled: u64, total: Option<u64>) -> Option<f64> {
    let total = total.filter(|&t| t > 0)?;
    let pct = handled as f64 / total as f64 * 100.0;
    Some(((pct * 100.0).round() / 100.0).min(100.0))
}

/// Derived view of a stored run: percentage, throughput and ETA.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunProgress {
    pub run_id: String,
    pub status: RunStatus,
    pub processed: u64,
    pub failed: u64,
    pub total: Option<u64>,
    pub percentage: Option<f64>,
    pub remaining: Option<u64>,
    pub elapsed: Duration,
    /// Items per second since the run started
    pub rate: Option<f64>,
    pub eta: Option<Duration>,
}

impl RunProgress {
    /// Compute progress for `run` as of `now`.
    pub fn from_run(run: &Run, now: DateTime<Utc>) -> Self {
        let handled = run.items_handled();
        let end = run.completed_at.unwrap_or(now);
        let elapsed = (end - run.started_at).to_std().unwrap_or(Duration::ZERO);

        let remaining = run.total_items.map(|t| t.saturating_sub(handled));
        let rate = (handled > 0 && !elapsed.is_zero())
            .then(|| handled as f64 / elapsed.as_secs_f64());

        let eta = match (run.status, remaining, rate) {
            (RunStatus::Running, Some(remaining), Some(rate)) if rate > 0.0 => {
                Some(Duration::from_secs_f64(remaining as f64 / rate))
            }
            _ => None,
        };

        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            processed: run.items_processed,
            failed: run.items_failed,
            total: run.total_items,
            percentage: percentage(handled, run.total_items),
            remaining,
            elapsed,
            rate,
            eta,
        }
    }
}
