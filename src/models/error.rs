//! Error types for storescout.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (invalid item, unknown run, caller misuse)
//! - I^B materialized: Infrastructure failures (network, timeout, rate limits)
//! - K_i violated: Internal invariant violations (storage, accounting)
//!
//! Every error carries an [`ErrorKind`] tag. Retry decisions dispatch on the
//! tag, never on the concrete variant.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Retry disposition tag carried by every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// May succeed if attempted again (network blips, 429, 5xx).
    Transient,
    /// Input is permanently invalid; counted as failed, never retried.
    Validation,
    /// Cannot be recovered by retrying.
    Fatal,
}

/// Anything that can report its [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Minimum wait the remote side asked for, if any.
    fn retry_hint(&self) -> Option<Duration> {
        None
    }
}

/// Errors raised while acquiring items from a remote source.
#[derive(Debug, Error)]
pub enum AcquireError {
    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Response did not match expectations
    // ═══════════════════════════════════════════════════════════════════

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid source configuration: {0}")]
    Invalid(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl Classify for AcquireError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(e) if e.is_decode() => ErrorKind::Validation,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => {
                ErrorKind::Transient
            }
            Self::Unavailable(_) => ErrorKind::Transient,
            Self::Http { status, .. } => classify_status(*status),
            Self::Parse(_) => ErrorKind::Validation,
            Self::Invalid(_) | Self::Io { .. } => ErrorKind::Fatal,
        }
    }

    fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } if retry_after_secs.is_finite() => {
                Some(Duration::from_secs_f64(retry_after_secs.max(0.0)))
            }
            _ => None,
        }
    }
}

/// Map an HTTP status code onto an [`ErrorKind`].
///
/// K_i: 408/429/5xx are the server asking us to come back later.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        408 | 425 | 429 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Errors raised by a batch sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize item: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transient sink failure: {0}")]
    Transient(String),

    #[error("Sink failure: {0}")]
    Fatal(String),
}

impl SinkError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl Classify for SinkError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Transient(_) => ErrorKind::Transient,
            Self::Serialize(_) | Self::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Per-item validity failure. Absorbed into the failed counter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid item {key}: {reason}")]
pub struct ValidationError {
    pub key: String,
    pub reason: String,
}

impl Classify for ValidationError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Errors raised by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Checkpoint state is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Invalid state for run {run_id}: {reason}")]
    InvalidState { run_id: String, reason: String },
}

impl CheckpointError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_state(run_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            run_id: run_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl Classify for CheckpointError {
    fn kind(&self) -> ErrorKind {
        // Progress that cannot be recorded durably is never retried.
        ErrorKind::Fatal
    }
}

/// Top-level error type for batch runs.
#[derive(Debug, Error)]
pub enum BatchError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Caller misuse (surfaced immediately, never retried)
    // ═══════════════════════════════════════════════════════════════════

    #[error("No run to resume")]
    NoRunToResume,

    #[error("Run {0} is already completed")]
    AlreadyCompleted(String),

    #[error("Resume input does not match run {run_id}: {reason}")]
    ResumeMismatch { run_id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Retries exhausted or run interrupted
    // ═══════════════════════════════════════════════════════════════════

    #[error("Run {run_id} failed while acquiring items: {source}")]
    Acquire {
        run_id: String,
        #[source]
        source: AcquireError,
    },

    #[error("Run {run_id} failed at batch {batch_index}: {source}")]
    Sink {
        run_id: String,
        batch_index: i64,
        #[source]
        source: SinkError,
    },

    #[error("Run {run_id} cancelled")]
    Cancelled { run_id: String },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken
    // ═══════════════════════════════════════════════════════════════════

    #[error("Sink reported {reported} outcomes for batch {batch_index} of {expected} items")]
    Accounting {
        batch_index: i64,
        expected: usize,
        reported: u64,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl BatchError {
    /// Run id the error belongs to, when one was already created.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::AlreadyCompleted(run_id)
            | Self::ResumeMismatch { run_id, .. }
            | Self::Acquire { run_id, .. }
            | Self::Sink { run_id, .. }
            | Self::Cancelled { run_id } => Some(run_id),
            Self::Checkpoint(CheckpointError::InvalidState { run_id, .. }) => Some(run_id),
            _ => None,
        }
    }
}

impl Classify for BatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Acquire { source, .. } => source.kind(),
            Self::Sink { source, .. } => source.kind(),
            Self::Cancelled { .. } => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }
}

/// Result type alias for storescout.
pub type Result<T, E = BatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(429), ErrorKind::Transient);
        assert_eq!(classify_status(503), ErrorKind::Transient);
        assert_eq!(classify_status(404), ErrorKind::Fatal);
        assert_eq!(classify_status(401), ErrorKind::Fatal);
    }

    #[test]
    fn test_acquire_error_kinds() {
        assert!(AcquireError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(AcquireError::RateLimited { retry_after_secs: 2.0 }.is_retryable());
        assert!(!AcquireError::Parse("bad json".into()).is_retryable());
        assert_eq!(
            AcquireError::Parse("bad json".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            AcquireError::Http {
                status: 500,
                url: "https://example.invalid".into()
            }
            .kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_batch_error_run_id() {
        let err = BatchError::Cancelled {
            run_id: "rewe_1".into(),
        };
        assert_eq!(err.run_id(), Some("rewe_1"));
        assert_eq!(BatchError::NoRunToResume.run_id(), None);
    }
}
