//! Stores from a local JSONL file, one `Store` per line.

use crate::batch::ItemFeed;
use crate::models::{AcquireError, Store};
use std::path::Path;
use std::vec::IntoIter;
use tracing::{info, warn};

/// Positional feed over a JSONL file. Unparseable lines are skipped up front
/// and never counted in the total.
pub struct FileFeed {
    stores: IntoIter<Store>,
    total: u64,
    skipped: usize,
}

impl FileFeed {
    pub fn open(path: &Path) -> Result<Self, AcquireError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AcquireError::io(format!("reading {}", path.display()), e))?;
        let feed = Self::from_jsonl(&content);
        info!(
            path = %path.display(),
            stores = feed.total,
            skipped = feed.skipped,
            "Opened store file"
        );
        Ok(feed)
    }

    pub fn from_jsonl(content: &str) -> Self {
        let mut stores = Vec::new();
        let mut skipped = 0;
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Store>(line) {
                Ok(store) => stores.push(store),
                Err(e) => {
                    warn!(line = n + 1, error = %e, "Skipping unparseable store line");
                    skipped += 1;
                }
            }
        }
        Self {
            total: stores.len() as u64,
            stores: stores.into_iter(),
            skipped,
        }
    }

    /// Lines that did not parse as a store.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl ItemFeed for FileFeed {
    type Item = Store;

    async fn next_item(&mut self) -> Result<Option<Store>, AcquireError> {
        Ok(self.stores.next())
    }

    fn total_hint(&self) -> Option<u64> {
        Some(self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn line(id: &str) -> String {
        serde_json::to_string(&Store::new("file", id, "Markt", "Weg 1", "12345", "Ort")).unwrap()
    }

    #[tokio::test]
    async fn test_reads_stores_skipping_bad_lines() {
        let content = format!("{}\n\nnot json\n{}\n", line("a"), line("b"));
        let mut feed = FileFeed::from_jsonl(&content);
        assert_eq!(feed.total_hint(), Some(2));
        assert_eq!(feed.skipped(), 1);

        assert_eq!(feed.next_item().await.unwrap().unwrap().store_id, "a");
        assert_eq!(feed.next_item().await.unwrap().unwrap().store_id, "b");
        assert!(feed.next_item().await.unwrap().is_none());
        assert!(feed.bookmark().is_none());
    }

    #[tokio::test]
    async fn test_bad_lines_do_not_hold_back_progress() {
        use crate::batch::{BatchOutcome, BatchRunner, ProgressUpdate, RetryPolicy, RunOptions};
        use crate::checkpoint::CheckpointStore;

        let content = format!("{}\n{{broken\n{}\n{}\n", line("a"), line("b"), line("c"));
        let feed = FileFeed::from_jsonl(&content);
        let mut runner =
            BatchRunner::new(CheckpointStore::in_memory().unwrap(), RetryPolicy::immediate(1));
        let mut sink = |batch: &[Store]| Ok(BatchOutcome::new(batch.len() as u64, 0));
        let mut last = None;
        let mut on_progress = |u: &ProgressUpdate| last = u.percentage;

        let result = runner
            .process(feed, "file", RunOptions::new(2), &mut sink, Some(&mut on_progress))
            .await
            .unwrap();
        assert_eq!(result.processed, 3);
        assert_eq!(last, Some(100.0));
    }

    #[tokio::test]
    async fn test_open_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stores.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", line("x")).unwrap();

        let mut feed = FileFeed::open(&path).unwrap();
        assert_eq!(feed.next_item().await.unwrap().unwrap().store_id, "x");
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = FileFeed::open(&dir.path().join("nope.jsonl"));
        assert!(matches!(result, Err(AcquireError::Io { .. })));
    }
}
