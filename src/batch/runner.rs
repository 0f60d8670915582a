//! Batch runner: drives a feed into a sink, checkpointing after every batch.
//!
//! Epistemic foundation:
//! - K_i: Batches are consecutive, fixed-size (except the last) slices of unique items
//! - K_i: A batch is credited only after the sink accepted it AND its checkpoint is durable
//! - B_i: Sink and feed may fail → batch-level retry, then the run fails resumably
//! - I^B: A crash mid-batch loses only that batch; the last checkpoint is the recovery point

use super::{DedupLedger, ItemFeed, IterFeed, ProgressUpdate, RetryPolicy};
use crate::checkpoint::{
    Checkpoint, CheckpointStore, ResumeDescriptor, ResumeOutcome, ResumeState, RunStatus,
};
use crate::models::{AcquireError, BatchError, Classify, Item, Result, SinkError};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// What the sink made of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: u64,
    pub failed: u64,
}

impl BatchOutcome {
    pub fn new(processed: u64, failed: u64) -> Self {
        Self { processed, failed }
    }

    pub fn total(&self) -> u64 {
        self.processed + self.failed
    }
}

/// Consumer of batches (e.g. validate and persist).
///
/// Item-level problems belong in `failed`; an `Err` rejects the whole batch
/// and is retried according to its [`ErrorKind`](crate::models::ErrorKind).
#[allow(async_fn_in_trait)]
pub trait BatchSink<T> {
    async fn write_batch(&mut self, batch: &[T]) -> std::result::Result<BatchOutcome, SinkError>;
}

impl<T, F> BatchSink<T> for F
where
    F: FnMut(&[T]) -> std::result::Result<BatchOutcome, SinkError>,
{
    async fn write_batch(&mut self, batch: &[T]) -> std::result::Result<BatchOutcome, SinkError> {
        self(batch)
    }
}

/// Progress callback, invoked once per checkpointed batch.
pub type ProgressFn<'a> = &'a mut dyn FnMut(&ProgressUpdate);

/// Options for a fresh run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    /// Attempts per batch; `None` keeps the runner's policy
    pub max_retries: Option<u32>,
    /// Cap on unique items; everything beyond it is never pulled
    pub item_limit: Option<usize>,
    /// Caller state stored with every checkpoint
    pub custom_state: Option<Value>,
}

impl RunOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            max_retries: None,
            item_limit: None,
            custom_state: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn item_limit(mut self, limit: usize) -> Self {
        self.item_limit = Some(limit);
        self
    }

    pub fn custom_state(mut self, state: Value) -> Self {
        self.custom_state = Some(state);
        self
    }
}

/// Final counters of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub run_id: String,
    pub processed: u64,
    pub failed: u64,
    pub status: RunStatus,
    /// Repeated items dropped during this call
    pub duplicates: u64,
}

/// Mutable state of one run while it is being driven.
///
/// `processed`/`failed` always equal the last durable checkpoint.
struct RunState {
    run_id: String,
    batch_size: usize,
    next_batch_index: i64,
    processed: u64,
    failed: u64,
    ledger: DedupLedger,
    custom: Option<Value>,
    item_limit: Option<u64>,
    /// Attempts chosen at run start; `None` means the runner default
    max_attempts: Option<u32>,
    policy: RetryPolicy,
}

impl RunState {
    fn handled(&self) -> u64 {
        self.processed + self.failed
    }

    fn limit_reached(&self, pending: usize) -> bool {
        self.item_limit
            .is_some_and(|limit| self.handled() + pending as u64 >= limit)
    }

    fn total(&self, hint: Option<u64>) -> Option<u64> {
        capped_total(hint, self.item_limit).map(|t| t.max(self.handled()))
    }
}

/// Feed estimate bounded by the item limit. Unknown stays unknown.
fn capped_total(hint: Option<u64>, limit: Option<u64>) -> Option<u64> {
    match (hint, limit) {
        (Some(hint), Some(limit)) => Some(hint.min(limit)),
        (hint, _) => hint,
    }
}

/// Orchestrates checkpointing, dedup, retry and progress for one run at a time.
pub struct BatchRunner {
    store: CheckpointStore,
    retry: RetryPolicy,
    cancel: CancellationToken,
    last_run_id: Option<String>,
}

impl BatchRunner {
    pub fn new(store: CheckpointStore, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            cancel: CancellationToken::new(),
            last_run_id: None,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token checked between batches.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run most recently created or resumed by this runner.
    pub fn last_run_id(&self) -> Option<&str> {
        self.last_run_id.as_deref()
    }

    /// Start a fresh run over `feed`.
    pub async fn process<F, S>(
        &mut self,
        mut feed: F,
        source_id: &str,
        options: RunOptions,
        sink: &mut S,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<RunResult>
    where
        F: ItemFeed,
        S: BatchSink<F::Item>,
    {
        if options.batch_size == 0 {
            return Err(BatchError::InvalidInput(
                "batch size must be at least 1".into(),
            ));
        }

        let item_limit = options.item_limit.map(|l| l as u64);
        let estimate = capped_total(feed.total_hint(), item_limit);

        let run_id = self
            .store
            .create_run(source_id, estimate, options.batch_size)?;
        self.last_run_id = Some(run_id.clone());

        let state = RunState {
            run_id: run_id.clone(),
            batch_size: options.batch_size,
            next_batch_index: 0,
            processed: 0,
            failed: 0,
            ledger: DedupLedger::new(),
            custom: options.custom_state,
            item_limit,
            max_attempts: options.max_retries,
            policy: self.policy_for(options.max_retries),
        };

        let span = info_span!("run", run_id = %run_id, source = source_id);
        async {
            info!(
                batch_size = state.batch_size,
                total = estimate,
                limit = item_limit,
                "Starting run"
            );
            self.drive(state, &mut feed, sink, progress).await
        }
        .instrument(span)
        .await
    }

    /// Start a fresh run over an in-memory collection.
    pub async fn process_items<I, S>(
        &mut self,
        items: I,
        source_id: &str,
        options: RunOptions,
        sink: &mut S,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<RunResult>
    where
        I: IntoIterator,
        I::Item: Item,
        S: BatchSink<I::Item>,
    {
        self.process(IterFeed::new(items), source_id, options, sink, progress)
            .await
    }

    /// Continue a failed or interrupted run.
    ///
    /// Without a usable bookmark, `feed` must yield the same ordered items as
    /// the original run: the first `processed + failed` unique items are
    /// skipped, and a replay that runs short or ends on a different key than
    /// the last checkpoint fails with `ResumeMismatch` before anything is written.
    pub async fn resume<F, S>(
        &mut self,
        mut feed: F,
        sink: &mut S,
        progress: Option<ProgressFn<'_>>,
        run_id: Option<&str>,
    ) -> Result<RunResult>
    where
        F: ItemFeed,
        S: BatchSink<F::Item>,
    {
        let run_id = match run_id.or(self.last_run_id.as_deref()) {
            Some(id) => id.to_string(),
            None => return Err(BatchError::NoRunToResume),
        };

        let descriptor = match self.store.resume_run(&run_id)? {
            ResumeOutcome::AlreadyCompleted(_) => return Err(BatchError::AlreadyCompleted(run_id)),
            ResumeOutcome::Resumable(descriptor) => descriptor,
        };
        self.last_run_id = Some(run_id.clone());

        let span = info_span!("run", run_id = %run_id, source = %descriptor.source_id);
        async {
            let state = self.prepare_resume(&descriptor, &mut feed).await?;
            if descriptor.status == RunStatus::Failed {
                self.store.reopen_run(&run_id)?;
            }

            info!(
                start_index = descriptor.start_index(),
                next_batch = state.next_batch_index,
                batch_size = state.batch_size,
                "Resuming run"
            );
            self.drive(state, &mut feed, sink, progress).await
        }
        .instrument(span)
        .await
    }

    /// Continue a run over an in-memory collection.
    pub async fn resume_items<I, S>(
        &mut self,
        items: I,
        sink: &mut S,
        progress: Option<ProgressFn<'_>>,
        run_id: Option<&str>,
    ) -> Result<RunResult>
    where
        I: IntoIterator,
        I::Item: Item,
        S: BatchSink<I::Item>,
    {
        self.resume(IterFeed::new(items), sink, progress, run_id)
            .await
    }

    /// Position `feed` after the checkpointed items and rebuild the ledger.
    async fn prepare_resume<F: ItemFeed>(
        &self,
        descriptor: &ResumeDescriptor,
        feed: &mut F,
    ) -> Result<RunState> {
        let run_id = descriptor.run_id.clone();
        let saved = ResumeState::from_value(descriptor.custom_state.as_ref());

        let acquire = |source: AcquireError| BatchError::Acquire {
            run_id: run_id.clone(),
            source,
        };

        let restored = match &saved.bookmark {
            Some(bookmark) => feed.restore(bookmark).await.map_err(acquire)?,
            None => false,
        };

        let ledger = if restored {
            debug!(keys = saved.seen_keys.len(), "Restored feed from bookmark");
            DedupLedger::from_keys(saved.seen_keys.iter().cloned())
        } else {
            let start = descriptor.start_index();
            let mut ledger = DedupLedger::new();
            let mut skipped = 0u64;
            let mut last_skipped = None;

            while skipped < start {
                let Some(item) = feed.next_item().await.map_err(acquire)? else {
                    return Err(BatchError::ResumeMismatch {
                        run_id: descriptor.run_id.clone(),
                        reason: format!(
                            "input ended after {skipped} unique items, checkpoint covers {start}"
                        ),
                    });
                };
                let key = item.identity_key();
                if ledger.insert(&key) {
                    skipped += 1;
                    last_skipped = Some(key);
                }
            }

            if let (Some(expected), Some(actual)) = (&saved.last_key, &last_skipped)
                && expected != actual
            {
                return Err(BatchError::ResumeMismatch {
                    run_id: descriptor.run_id.clone(),
                    reason: format!(
                        "item {start} is '{actual}' but the checkpoint ended at '{expected}'"
                    ),
                });
            }
            debug!(skipped, "Replayed checkpointed items");
            ledger
        };

        Ok(RunState {
            run_id: descriptor.run_id.clone(),
            batch_size: descriptor.batch_size.max(1),
            next_batch_index: descriptor.next_batch_index(),
            processed: descriptor.items_processed,
            failed: descriptor.items_failed,
            ledger,
            custom: saved.custom,
            item_limit: saved.item_limit,
            max_attempts: saved.max_attempts,
            policy: self.policy_for(saved.max_attempts),
        })
    }

    fn policy_for(&self, max_attempts: Option<u32>) -> RetryPolicy {
        max_attempts.map_or_else(|| self.retry.clone(), |n| self.retry.with_max_attempts(n))
    }

    /// Batch loop shared by `process` and `resume`.
    async fn drive<F, S>(
        &mut self,
        mut state: RunState,
        feed: &mut F,
        sink: &mut S,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<RunResult>
    where
        F: ItemFeed,
        S: BatchSink<F::Item>,
    {
        let duplicates_before = state.ledger.duplicates();

        loop {
            if self.cancel.is_cancelled() {
                warn!(
                    processed = state.processed,
                    failed = state.failed,
                    "Cancellation requested, stopping at batch boundary"
                );
                self.fail(&state, "cancelled");
                return Err(BatchError::Cancelled {
                    run_id: state.run_id,
                });
            }

            let batch = match self.fill_batch(&mut state, feed).await {
                Ok(batch) => batch,
                Err(source) => {
                    error!(error = %source, "Acquiring items failed");
                    self.fail(&state, &source.to_string());
                    return Err(BatchError::Acquire {
                        run_id: state.run_id,
                        source,
                    });
                }
            };
            if batch.is_empty() {
                break;
            }

            let batch_index = state.next_batch_index;
            let outcome = match write_with_retry(&state.policy, sink, &batch, batch_index).await {
                Ok(outcome) => outcome,
                Err(source) => {
                    error!(batch = batch_index, error = %source, "Batch failed, giving up");
                    self.fail(&state, &format!("batch {batch_index}: {source}"));
                    return Err(BatchError::Sink {
                        run_id: state.run_id,
                        batch_index,
                        source,
                    });
                }
            };

            if outcome.total() != batch.len() as u64 {
                let err = BatchError::Accounting {
                    batch_index,
                    expected: batch.len(),
                    reported: outcome.total(),
                };
                self.fail(&state, &err.to_string());
                return Err(err);
            }

            let processed = state.processed + outcome.processed;
            let failed = state.failed + outcome.failed;
            let bookmark = feed.bookmark();
            let envelope = ResumeState {
                custom: state.custom.clone(),
                seen_keys: if bookmark.is_some() {
                    state.ledger.snapshot()
                } else {
                    Vec::new()
                },
                bookmark,
                last_key: batch.last().map(Item::identity_key),
                item_limit: state.item_limit,
                max_attempts: state.max_attempts,
            };
            let total = state.total(feed.total_hint()).map(|t| t.max(processed + failed));

            let checkpoint = Checkpoint {
                batch_index,
                items_processed: processed,
                items_failed: failed,
                total_items: total,
                custom_state: Some(envelope.to_value()),
            };
            if let Err(e) = self.store.save_checkpoint(&state.run_id, &checkpoint) {
                error!(batch = batch_index, error = %e, "Checkpoint write failed, aborting run");
                self.fail(&state, &e.to_string());
                return Err(e.into());
            }

            state.processed = processed;
            state.failed = failed;
            state.next_batch_index += 1;

            info!(
                batch = batch_index,
                size = batch.len(),
                processed,
                failed,
                "Batch checkpointed"
            );

            if let Some(callback) = progress.as_deref_mut() {
                let update = ProgressUpdate::new(batch_index, processed, failed, total);
                if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
                    warn!(batch = batch_index, "Progress callback panicked, continuing");
                }
            }

            // Short batch or limit hit: the feed has nothing more for this run
            if batch.len() < state.batch_size || state.limit_reached(0) {
                break;
            }
        }

        self.store
            .complete_run(&state.run_id, state.processed, state.failed)?;

        let duplicates = state.ledger.duplicates() - duplicates_before;
        info!(
            processed = state.processed,
            failed = state.failed,
            duplicates,
            batches = state.next_batch_index,
            "Run completed"
        );

        Ok(RunResult {
            run_id: state.run_id,
            processed: state.processed,
            failed: state.failed,
            status: RunStatus::Completed,
            duplicates,
        })
    }

    /// Pull up to `batch_size` unique items, honouring the item limit.
    async fn fill_batch<F: ItemFeed>(
        &self,
        state: &mut RunState,
        feed: &mut F,
    ) -> std::result::Result<Vec<F::Item>, AcquireError> {
        let mut batch = Vec::with_capacity(state.batch_size);

        while batch.len() < state.batch_size && !state.limit_reached(batch.len()) {
            let Some(item) = feed.next_item().await? else {
                break;
            };
            if !state.ledger.admit(&item) {
                debug!(key = %item.identity_key(), "Dropping duplicate item");
                continue;
            }
            batch.push(item);
        }

        Ok(batch)
    }

    /// Mark the run failed with the counters of its last checkpoint.
    fn fail(&self, state: &RunState, message: &str) {
        if let Err(e) = self
            .store
            .fail_run(&state.run_id, message, state.processed, state.failed)
        {
            error!(error = %e, "Could not mark run failed");
        }
    }
}

/// Hand one batch to the sink, retrying transient failures.
async fn write_with_retry<T, S: BatchSink<T>>(
    policy: &RetryPolicy,
    sink: &mut S,
    batch: &[T],
    batch_index: i64,
) -> std::result::Result<BatchOutcome, SinkError> {
    let mut attempt = 0;

    loop {
        match sink.write_batch(batch).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                let Some(delay) = policy.next_delay(attempt, &err) else {
                    return Err(err);
                };
                warn!(
                    batch = batch_index,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Batch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Run;
    use crate::models::CheckpointError;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec(u32);

    impl Item for Rec {
        fn identity_key(&self) -> String {
            format!("rec_{}", self.0)
        }
    }

    fn recs(range: std::ops::Range<u32>) -> Vec<Rec> {
        range.map(Rec).collect()
    }

    fn runner() -> BatchRunner {
        BatchRunner::new(CheckpointStore::in_memory().unwrap(), RetryPolicy::immediate(3))
    }

    /// Sink that records every accepted batch.
    fn recording_sink(seen: &RefCell<Vec<Vec<u32>>>) -> impl FnMut(&[Rec]) -> std::result::Result<BatchOutcome, SinkError> + '_ {
        move |batch: &[Rec]| {
            seen.borrow_mut().push(batch.iter().map(|r| r.0).collect());
            Ok(BatchOutcome::new(batch.len() as u64, 0))
        }
    }

    fn run_of(runner: &BatchRunner, run_id: &str) -> Run {
        runner.store().get_run(run_id).unwrap()
    }

    #[tokio::test]
    async fn test_ceiling_partition() {
        for (n, size) in [(0u32, 4usize), (1, 4), (10, 3), (12, 4), (7, 10)] {
            let seen = RefCell::new(Vec::new());
            let mut sink = recording_sink(&seen);
            let mut runner = runner();
            let result = runner
                .process_items(recs(0..n), "file", RunOptions::new(size), &mut sink, None)
                .await
                .unwrap();

            let batches = seen.borrow();
            let expected_batches = (n as usize).div_ceil(size);
            assert_eq!(batches.len(), expected_batches, "n={n} size={size}");
            for (i, batch) in batches.iter().enumerate() {
                if i + 1 < batches.len() {
                    assert_eq!(batch.len(), size);
                } else {
                    assert!(!batch.is_empty() && batch.len() <= size);
                }
            }
            assert_eq!(result.processed + result.failed, n as u64);
            assert_eq!(result.status, RunStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_scenario_four_batches_with_progress() {
        let seen = RefCell::new(Vec::new());
        let mut sink = recording_sink(&seen);
        let mut updates = Vec::new();
        let mut on_progress = |u: &ProgressUpdate| updates.push(u.clone());

        let mut runner = runner();
        let result = runner
            .process_items(
                recs(0..100),
                "file",
                RunOptions::new(25),
                &mut sink,
                Some(&mut on_progress),
            )
            .await
            .unwrap();

        assert_eq!(result.processed, 100);
        let indices: Vec<_> = updates.iter().map(|u| u.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let pcts: Vec<_> = updates.iter().map(|u| u.percentage.unwrap()).collect();
        assert_eq!(pcts, vec![25.0, 50.0, 75.0, 100.0]);

        let run = run_of(&runner, &result.run_id);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_batch_index, 3);
        assert_eq!(run.total_items, Some(100));
    }

    #[tokio::test]
    async fn test_checkpoint_after_each_batch() {
        let mut runner = runner();
        let snapshots = RefCell::new(Vec::new());
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let mut on_progress = |u: &ProgressUpdate| {
            snapshots.borrow_mut().push((u.batch_index, u.processed));
        };

        let result = runner
            .process_items(recs(0..10), "file", RunOptions::new(3), &mut sink, Some(&mut on_progress))
            .await
            .unwrap();

        assert_eq!(
            *snapshots.borrow(),
            vec![(0, 3), (1, 6), (2, 9), (3, 10)]
        );
        assert_eq!(runner.last_run_id(), Some(result.run_id.as_str()));
    }

    #[tokio::test]
    async fn test_scenario_fail_then_resume() {
        let mut runner = runner();
        let calls = RefCell::new(0u32);
        let mut failing = |batch: &[Rec]| {
            *calls.borrow_mut() += 1;
            if batch[0].0 == 50 {
                Err(SinkError::Transient("disk full".into()))
            } else {
                Ok(BatchOutcome::new(batch.len() as u64, 0))
            }
        };

        let err = runner
            .process_items(
                recs(0..100),
                "file",
                RunOptions::new(25).max_retries(1),
                &mut failing,
                None,
            )
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();
        assert!(matches!(err, BatchError::Sink { batch_index: 2, .. }));
        assert_eq!(*calls.borrow(), 3);

        let run = run_of(&runner, &run_id);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.items_processed, 50);
        assert_eq!(run.items_failed, 0);
        assert_eq!(run.current_batch_index, 1);
        assert!(run.error_message.unwrap().contains("disk full"));

        let seen = RefCell::new(Vec::new());
        let mut sink = recording_sink(&seen);
        let mut indices = Vec::new();
        let mut on_progress = |u: &ProgressUpdate| indices.push(u.batch_index);
        let result = runner
            .resume_items(recs(0..100), &mut sink, Some(&mut on_progress), None)
            .await
            .unwrap();

        let resumed: Vec<u32> = seen.borrow().iter().flatten().copied().collect();
        assert_eq!(resumed, (50..100).collect::<Vec<_>>());
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(result.run_id, run_id);
        assert_eq!(result.processed + result.failed, 100);

        let run = run_of(&runner, &run_id);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_batch_index, 3);
    }

    #[tokio::test]
    async fn test_resume_completed_run_has_no_side_effects() {
        let mut runner = runner();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let result = runner
            .process_items(recs(0..10), "file", RunOptions::new(5), &mut sink, None)
            .await
            .unwrap();
        let before = run_of(&runner, &result.run_id);

        let touched = RefCell::new(false);
        let mut watching = |_: &[Rec]| {
            *touched.borrow_mut() = true;
            Ok(BatchOutcome::default())
        };
        let err = runner
            .resume_items(recs(0..10), &mut watching, None, Some(&result.run_id))
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::AlreadyCompleted(ref id) if id == &result.run_id));
        assert!(!*touched.borrow());
        assert_eq!(run_of(&runner, &result.run_id), before);
    }

    #[tokio::test]
    async fn test_resume_without_run() {
        let mut runner = runner();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let err = runner
            .resume_items(recs(0..3), &mut sink, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NoRunToResume));

        let err = runner
            .resume_items(recs(0..3), &mut sink, None, Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::Checkpoint(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dedup_counts_once() {
        let mut runner = runner();
        let seen = RefCell::new(Vec::new());
        let mut sink = recording_sink(&seen);
        let items = vec![Rec(1), Rec(2), Rec(1), Rec(3), Rec(2), Rec(4)];

        let result = runner
            .process_items(items, "file", RunOptions::new(2), &mut sink, None)
            .await
            .unwrap();

        assert_eq!(result.processed, 4);
        assert_eq!(result.duplicates, 2);
        assert_eq!(*seen.borrow(), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(run_of(&runner, &result.run_id).total_items, Some(4));
    }

    #[tokio::test]
    async fn test_item_limit_is_exact() {
        let mut runner = runner();
        let seen = RefCell::new(Vec::new());
        let mut sink = recording_sink(&seen);
        let pulled = RefCell::new(0u32);
        let source = (0..1000).map(|i| {
            *pulled.borrow_mut() += 1;
            Rec(i)
        });

        let result = runner
            .process_items(source, "file", RunOptions::new(3).item_limit(10), &mut sink, None)
            .await
            .unwrap();

        assert_eq!(result.processed, 10);
        assert_eq!(*pulled.borrow(), 10);
        assert_eq!(seen.borrow().iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn test_item_failures_are_counted_not_retried() {
        let mut runner = runner();
        let calls = RefCell::new(0u32);
        let mut sink = |batch: &[Rec]| {
            *calls.borrow_mut() += 1;
            let failed = batch.iter().filter(|r| r.0 % 2 == 1).count() as u64;
            Ok(BatchOutcome::new(batch.len() as u64 - failed, failed))
        };

        let result = runner
            .process_items(recs(0..10), "file", RunOptions::new(5), &mut sink, None)
            .await
            .unwrap();

        assert_eq!(result.processed, 5);
        assert_eq!(result.failed, 5);
        assert_eq!(*calls.borrow(), 2);
    }

    #[tokio::test]
    async fn test_fatal_sink_error_not_retried() {
        let mut runner = runner();
        let calls = RefCell::new(0u32);
        let mut sink = |_: &[Rec]| {
            *calls.borrow_mut() += 1;
            Err::<BatchOutcome, _>(SinkError::Fatal("schema mismatch".into()))
        };

        let err = runner
            .process_items(recs(0..10), "file", RunOptions::new(5), &mut sink, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Sink { batch_index: 0, .. }));
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn test_transient_sink_error_retried_then_succeeds() {
        let mut runner = runner();
        let calls = RefCell::new(0u32);
        let mut sink = |batch: &[Rec]| {
            *calls.borrow_mut() += 1;
            if *calls.borrow() == 1 {
                Err(SinkError::Transient("locked".into()))
            } else {
                Ok(BatchOutcome::new(batch.len() as u64, 0))
            }
        };

        let result = runner
            .process_items(recs(0..4), "file", RunOptions::new(4), &mut sink, None)
            .await
            .unwrap();
        assert_eq!(result.processed, 4);
        assert_eq!(*calls.borrow(), 2);
    }

    #[tokio::test]
    async fn test_accounting_mismatch_fails_run() {
        let mut runner = runner();
        let mut sink = |_: &[Rec]| Ok(BatchOutcome::new(1, 0));
        let err = runner
            .process_items(recs(0..4), "file", RunOptions::new(4), &mut sink, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Accounting { expected: 4, reported: 1, .. }));
        let run_id = runner.last_run_id().unwrap().to_string();
        assert_eq!(run_of(&runner, &run_id).status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let mut runner = runner();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let err = runner
            .process_items(recs(0..4), "file", RunOptions::new(0), &mut sink, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));
        assert!(runner.store().list_runs(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_progress_callback_does_not_abort() {
        let mut runner = runner();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let mut on_progress = |u: &ProgressUpdate| {
            if u.batch_index >= 0 {
                panic!("display broke");
            }
        };

        let result = runner
            .process_items(recs(0..6), "file", RunOptions::new(2), &mut sink, Some(&mut on_progress))
            .await
            .unwrap();
        assert_eq!(result.processed, 6);
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let mut runner = runner();
        let token = runner.cancellation_token();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let mut on_progress = |u: &ProgressUpdate| {
            if u.batch_index == 1 {
                token.cancel();
            }
        };

        let err = runner
            .process_items(recs(0..10), "file", RunOptions::new(2), &mut sink, Some(&mut on_progress))
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();
        assert!(matches!(err, BatchError::Cancelled { .. }));

        let run = run_of(&runner, &run_id);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.items_processed, 4);
        assert_eq!(run.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_during_final_batch_completes() {
        let mut runner = runner();
        let token = runner.cancellation_token();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let mut on_progress = |u: &ProgressUpdate| {
            if u.batch_index == 2 {
                token.cancel();
            }
        };

        let result = runner
            .process_items(recs(0..5), "file", RunOptions::new(2), &mut sink, Some(&mut on_progress))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.processed, 5);
        assert_eq!(run_of(&runner, &result.run_id).status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_at_item_limit_completes() {
        let mut runner = runner();
        let token = runner.cancellation_token();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let mut on_progress = |_: &ProgressUpdate| token.cancel();

        let result = runner
            .process_items(
                recs(0..10),
                "file",
                RunOptions::new(2).item_limit(2),
                &mut sink,
                Some(&mut on_progress),
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.processed, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_aborts_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("checkpoints.db");
        let mut runner =
            BatchRunner::new(CheckpointStore::open(&db).unwrap(), RetryPolicy::immediate(3));

        let seen = RefCell::new(Vec::new());
        let mut sink = |batch: &[Rec]| {
            seen.borrow_mut().push(batch.iter().map(|r| r.0).collect::<Vec<_>>());
            if seen.borrow().len() == 2 {
                // Reject every further checkpoint write from outside the runner
                let conn = rusqlite::Connection::open(&db).unwrap();
                conn.execute_batch(
                    "CREATE TRIGGER reject_checkpoint BEFORE UPDATE OF current_batch ON runs
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                )
                .unwrap();
            }
            Ok(BatchOutcome::new(batch.len() as u64, 0))
        };
        let updates = RefCell::new(Vec::new());
        let mut on_progress = |u: &ProgressUpdate| updates.borrow_mut().push(u.batch_index);

        let err = runner
            .process_items(recs(0..6), "file", RunOptions::new(2), &mut sink, Some(&mut on_progress))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Checkpoint(_)));

        // Sink saw batch 1 exactly once, no progress for it, nothing after it
        assert_eq!(*seen.borrow(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(*updates.borrow(), vec![0]);

        let run_id = runner.last_run_id().unwrap().to_string();
        let run = run_of(&runner, &run_id);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.items_processed, 2);
        assert_eq!(run.current_batch_index, 0);
    }

    #[tokio::test]
    async fn test_resume_keeps_max_retries() {
        // Runner default allows 3 attempts per batch
        let mut runner = runner();
        let calls = RefCell::new(0u32);
        let mut flaky = |batch: &[Rec]| {
            *calls.borrow_mut() += 1;
            if batch[0].0 >= 2 {
                Err(SinkError::Transient("locked".into()))
            } else {
                Ok(BatchOutcome::new(batch.len() as u64, 0))
            }
        };

        let err = runner
            .process_items(recs(0..4), "file", RunOptions::new(2).max_retries(1), &mut flaky, None)
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();
        assert_eq!(*calls.borrow(), 2);

        let stored = run_of(&runner, &run_id).custom_state;
        assert_eq!(ResumeState::from_value(stored.as_ref()).max_attempts, Some(1));

        let err = runner
            .resume_items(recs(0..4), &mut flaky, None, Some(&run_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Sink { batch_index: 1, .. }));
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test]
    async fn test_resume_input_too_short() {
        let mut runner = runner();
        let mut failing = |batch: &[Rec]| {
            if batch[0].0 >= 4 {
                Err(SinkError::Fatal("boom".into()))
            } else {
                Ok(BatchOutcome::new(batch.len() as u64, 0))
            }
        };
        let err = runner
            .process_items(recs(0..8), "file", RunOptions::new(2), &mut failing, None)
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();
        let before = run_of(&runner, &run_id);

        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let err = runner
            .resume_items(recs(0..3), &mut sink, None, Some(&run_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::ResumeMismatch { .. }));
        assert_eq!(run_of(&runner, &run_id), before);
    }

    #[tokio::test]
    async fn test_resume_reordered_input_detected() {
        let mut runner = runner();
        let mut failing = |batch: &[Rec]| {
            if batch[0].0 >= 4 {
                Err(SinkError::Fatal("boom".into()))
            } else {
                Ok(BatchOutcome::new(batch.len() as u64, 0))
            }
        };
        let err = runner
            .process_items(recs(0..8), "file", RunOptions::new(2), &mut failing, None)
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();

        let mut reordered = recs(0..8);
        reordered.reverse();
        let mut sink = |batch: &[Rec]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let err = runner
            .resume_items(reordered, &mut sink, None, Some(&run_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::ResumeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_resume_keeps_custom_state_and_limit() {
        let mut runner = runner();
        let mut failing = |batch: &[Rec]| {
            if batch[0].0 >= 4 {
                Err(SinkError::Fatal("boom".into()))
            } else {
                Ok(BatchOutcome::new(batch.len() as u64, 0))
            }
        };
        let options = RunOptions::new(2)
            .item_limit(6)
            .custom_state(json!({"region": "Bayern"}));
        let err = runner
            .process_items(recs(0..20), "file", options, &mut failing, None)
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();

        let stored = run_of(&runner, &run_id).custom_state.unwrap();
        let envelope = ResumeState::from_value(Some(&stored));
        assert_eq!(envelope.custom, Some(json!({"region": "Bayern"})));
        assert_eq!(envelope.last_key.as_deref(), Some("rec_3"));

        let seen = RefCell::new(Vec::new());
        let mut sink = recording_sink(&seen);
        let result = runner
            .resume_items(recs(0..20), &mut sink, None, Some(&run_id))
            .await
            .unwrap();
        assert_eq!(*seen.borrow(), vec![vec![4, 5]]);
        assert_eq!(result.processed, 6);
    }

    /// Feed that can bookmark its position, with a scripted failure.
    struct ScriptedFeed {
        items: VecDeque<Rec>,
        position: u64,
        fail_at: Option<u64>,
        restored_from: Option<u64>,
    }

    impl ScriptedFeed {
        fn new(items: Vec<Rec>, fail_at: Option<u64>) -> Self {
            Self {
                items: items.into(),
                position: 0,
                fail_at,
                restored_from: None,
            }
        }
    }

    impl ItemFeed for ScriptedFeed {
        type Item = Rec;

        async fn next_item(&mut self) -> std::result::Result<Option<Rec>, AcquireError> {
            if self.fail_at == Some(self.position) {
                return Err(AcquireError::Unavailable("page fetch failed".into()));
            }
            let item = self.items.pop_front();
            if item.is_some() {
                self.position += 1;
            }
            Ok(item)
        }

        fn bookmark(&self) -> Option<Value> {
            Some(json!({ "position": self.position }))
        }

        async fn restore(&mut self, bookmark: &Value) -> std::result::Result<bool, AcquireError> {
            let Some(position) = bookmark["position"].as_u64() else {
                return Ok(false);
            };
            for _ in 0..position {
                self.items.pop_front();
            }
            self.position = position;
            self.restored_from = Some(position);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_acquire_failure_then_bookmark_resume() {
        let mut runner = runner();
        let mut items = recs(0..7);
        items.insert(3, Rec(1));

        let seen = RefCell::new(Vec::new());
        let mut sink = recording_sink(&seen);
        let err = runner
            .process(
                ScriptedFeed::new(items.clone(), Some(6)),
                "scripted",
                RunOptions::new(2),
                &mut sink,
                None,
            )
            .await
            .unwrap_err();
        let run_id = err.run_id().unwrap().to_string();
        assert!(matches!(err, BatchError::Acquire { .. }));

        let run = run_of(&runner, &run_id);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.items_processed, 4);
        let envelope = ResumeState::from_value(run.custom_state.as_ref());
        assert_eq!(envelope.bookmark, Some(json!({"position": 5})));
        assert_eq!(envelope.seen_keys.len(), 4);

        seen.borrow_mut().clear();
        let mut sink = recording_sink(&seen);
        let result = runner
            .resume(ScriptedFeed::new(items, None), &mut sink, None, Some(&run_id))
            .await
            .unwrap();

        assert_eq!(*seen.borrow(), vec![vec![4, 5], vec![6]]);
        assert_eq!(result.processed, 7);
        assert_eq!(result.duplicates, 0);
    }
}
