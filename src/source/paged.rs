//! Drives a `SourceAdapter` page by page as an `ItemFeed`.
//!
//! Epistemic foundation:
//! - K_i: Page fetches and enrichment lookups retry as whole calls
//! - K_i: Verification retries always restart at `establish_context`
//! - K_i: A refused context yields `Unknown`, never `Absent`
//! - B_i: A page fetched again at the same cursor holds the same items
//! - I^R: Bookmark = cursor of the current page + items handed out from it

use super::{Page, SourceAdapter};
use crate::batch::{ItemFeed, RetryError, RetryPolicy};
use crate::models::{AcquireError, Availability, Item};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Verification status of the item in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Unchecked,
    ContextReady,
    Resolved(Availability),
}

/// Counts of verification outcomes, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub present: u64,
    pub absent: u64,
    pub unknown: u64,
}

impl VerificationStats {
    fn record(&mut self, result: Availability) {
        match result {
            Availability::Present => self.present += 1,
            Availability::Absent => self.absent += 1,
            Availability::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PageBookmark {
    cursor: Value,
    offset: usize,
}

/// Feed that pulls pages from an adapter and enriches every item.
pub struct PagedFeed<A: SourceAdapter> {
    adapter: A,
    policy: RetryPolicy,
    /// Fixed delay between pages and between remote per-item calls
    pacing: Duration,
    cache: A::Cache,
    /// Cursor of the buffered page, `None` before the first fetch
    current: Option<A::Cursor>,
    next: Option<A::Cursor>,
    buffer: VecDeque<A::Item>,
    /// Items handed out from the buffered page
    offset: usize,
    total_hint: Option<u64>,
    pages_fetched: u64,
    stats: VerificationStats,
}

impl<A: SourceAdapter> PagedFeed<A> {
    pub fn new(adapter: A, policy: RetryPolicy, pacing: Duration) -> Self {
        Self {
            adapter,
            policy,
            pacing,
            cache: A::Cache::default(),
            current: None,
            next: None,
            buffer: VecDeque::new(),
            offset: 0,
            total_hint: None,
            pages_fetched: 0,
            stats: VerificationStats::default(),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn cache(&self) -> &A::Cache {
        &self.cache
    }

    pub fn stats(&self) -> &VerificationStats {
        &self.stats
    }

    async fn load_page(&mut self, cursor: A::Cursor) -> Result<(), AcquireError> {
        if self.pages_fetched > 0 {
            self.pace().await;
        }

        let adapter = &self.adapter;
        let page: Page<A::Item, A::Cursor> = self
            .policy
            .run("fetch_page", || adapter.fetch_page(&cursor))
            .await
            .map_err(RetryError::into_inner)?;

        self.pages_fetched += 1;
        debug!(
            source = self.adapter.source_id(),
            cursor = ?cursor,
            items = page.items.len(),
            last = page.next.is_none(),
            "Fetched page"
        );

        if page.total_hint.is_some() {
            self.total_hint = page.total_hint;
        }
        self.buffer = page.items.into();
        self.offset = 0;
        self.next = page.next;
        self.current = Some(cursor);
        Ok(())
    }

    /// Primary enrichment; a failed lookup leaves the item as it was.
    async fn enrich(&self, item: A::Item) -> A::Item {
        let adapter = &self.adapter;
        match self.policy.run("enrich", || adapter.enrich(&item)).await {
            Ok(Some(enriched)) => enriched,
            Ok(None) => item,
            Err(err) => {
                warn!(
                    source = adapter.source_id(),
                    key = %item.identity_key(),
                    error = %err.into_inner(),
                    "Enrichment failed, keeping item unenriched"
                );
                item
            }
        }
    }

    /// One pass through the verification state machine.
    async fn verify_once(&mut self, item: &A::Item) -> Result<Availability, AcquireError> {
        let mut status = Verification::Unchecked;
        loop {
            status = match status {
                Verification::Unchecked => {
                    if self.adapter.establish_context(item).await? {
                        Verification::ContextReady
                    } else {
                        Verification::Resolved(Availability::Unknown)
                    }
                }
                Verification::ContextReady => {
                    self.pace().await;
                    Verification::Resolved(self.adapter.query_context(&mut self.cache).await?)
                }
                Verification::Resolved(result) => return Ok(result),
            };
        }
    }

    /// Secondary verification with outer retries restarting from the context step.
    async fn verify(&mut self, item: &A::Item) -> Availability {
        let mut attempt = 0;
        loop {
            match self.verify_once(item).await {
                Ok(result) => return result,
                Err(err) => match self.policy.next_delay(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            key = %item.identity_key(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Verification failed, re-establishing context"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(
                            key = %item.identity_key(),
                            error = %err,
                            "Verification gave up, availability unknown"
                        );
                        return Availability::Unknown;
                    }
                },
            }
        }
    }

    async fn finish_item(&mut self, item: A::Item) -> A::Item {
        let mut item = self.enrich(item).await;

        if self.adapter.supports_verification() {
            self.pace().await;
            let result = self.verify(&item).await;
            self.stats.record(result);
            self.adapter.record_verification(&mut item, result);
        }
        item
    }

    async fn pace(&self) {
        if !self.pacing.is_zero() {
            sleep(self.pacing).await;
        }
    }
}

impl<A: SourceAdapter> ItemFeed for PagedFeed<A> {
    type Item = A::Item;

    async fn next_item(&mut self) -> Result<Option<A::Item>, AcquireError> {
        loop {
            if let Some(raw) = self.buffer.pop_front() {
                self.offset += 1;
                return Ok(Some(self.finish_item(raw).await));
            }

            let cursor = match (&self.current, self.next.take()) {
                (None, _) => self.adapter.first_cursor(),
                (Some(_), Some(next)) => next,
                (Some(_), None) => {
                    if self.adapter.supports_verification() {
                        info!(
                            source = self.adapter.source_id(),
                            present = self.stats.present,
                            absent = self.stats.absent,
                            unknown = self.stats.unknown,
                            "Verification summary"
                        );
                    }
                    return Ok(None);
                }
            };
            self.load_page(cursor).await?;
        }
    }

    fn total_hint(&self) -> Option<u64> {
        self.total_hint
    }

    fn bookmark(&self) -> Option<Value> {
        let cursor = serde_json::to_value(self.current.as_ref()?).ok()?;
        serde_json::to_value(PageBookmark {
            cursor,
            offset: self.offset,
        })
        .ok()
    }

    async fn restore(&mut self, bookmark: &Value) -> Result<bool, AcquireError> {
        let Ok(saved) = PageBookmark::deserialize(bookmark) else {
            return Ok(false);
        };
        let Ok(cursor) = A::Cursor::deserialize(&saved.cursor) else {
            return Ok(false);
        };

        self.load_page(cursor).await?;
        let skip = saved.offset.min(self.buffer.len());
        self.buffer.drain(..skip);
        self.offset = skip;
        info!(
            source = self.adapter.source_id(),
            offset = skip,
            "Restored paged feed"
        );
        Ok(true)
    }
}
