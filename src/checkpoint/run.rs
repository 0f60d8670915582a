//! Run records: one acquisition attempt for one source.
//!
//! Epistemic foundation:
//! - K_i: Status moves running → completed or running → failed, terminal states are immutable
//! - K_i: `current_batch_index` grows by exactly one per checkpointed batch
//! - B_i: `total_items` is a best-effort estimate → Option

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Durable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Last successfully completed batch ordinal (-1 before any batch)
    pub current_batch_index: i64,
    pub total_items: Option<u64>,
    pub batch_size: usize,
    pub items_processed: u64,
    pub items_failed: u64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub custom_state: Option<Value>,
}

impl Run {
    /// Items accounted for so far (processed + failed).
    pub fn items_handled(&self) -> u64 {
        self.items_processed + self.items_failed
    }
}

/// Progress snapshot written after each batch.
///
/// Counters and `custom_state` are always replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub batch_index: i64,
    pub items_processed: u64,
    pub items_failed: u64,
    /// Updated total estimate; `None` keeps the stored one
    pub total_items: Option<u64>,
    pub custom_state: Option<Value>,
}

/// Everything needed to continue a non-completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeDescriptor {
    pub run_id: String,
    pub source_id: String,
    pub status: RunStatus,
    pub batch_size: usize,
    pub last_batch_index: i64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub total_items: Option<u64>,
    pub custom_state: Option<Value>,
}

impl ResumeDescriptor {
    /// Number of unique items already accounted for.
    pub fn start_index(&self) -> u64 {
        self.items_processed + self.items_failed
    }

    /// Ordinal the next batch will carry.
    pub fn next_batch_index(&self) -> i64 {
        self.last_batch_index + 1
    }
}

impl From<Run> for ResumeDescriptor {
    fn from(run: Run) -> Self {
        Self {
            run_id: run.run_id,
            source_id: run.source_id,
            status: run.status,
            batch_size: run.batch_size,
            last_batch_index: run.current_batch_index,
            items_processed: run.items_processed,
            items_failed: run.items_failed,
            total_items: run.total_items,
            custom_state: run.custom_state,
        }
    }
}

/// Answer of [`CheckpointStore::resume_run`](super::CheckpointStore::resume_run).
///
/// A completed run is a sentinel, not an error: resuming finished work is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Resumable(ResumeDescriptor),
    AlreadyCompleted(Run),
}

/// Resume envelope stored in `custom_state`.
///
/// - `custom`: caller-supplied state, passed through untouched
/// - `bookmark`: feed position, when the feed can restore itself
/// - `seen_keys`: dedup ledger snapshot, kept only alongside a bookmark
/// - `last_key`: identity of the last credited item, checked on positional replay
/// - `item_limit`: unique-item cap of the run, honoured again on resume
/// - `max_attempts`: per-batch attempts the run was started with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seen_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl ResumeState {
    /// Decode an envelope; anything unrecognised is treated as plain custom state.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(state) => state,
            Err(_) => Self {
                custom: Some(value.clone()),
                ..Self::default()
            },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
