//! Per-run set of seen item identity keys.

use crate::models::Item;
use std::collections::HashSet;

/// In-memory dedup ledger for one run.
///
/// Sources may legitimately repeat items across pages; only the first
/// occurrence of a key reaches the sink.
#[derive(Debug, Default, Clone)]
pub struct DedupLedger {
    seen: HashSet<String>,
    duplicates: u64,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from a persisted key snapshot.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seen: keys.into_iter().map(Into::into).collect(),
            duplicates: 0,
        }
    }

    /// Record `key`. Returns `false` if it was already seen in this run.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            self.duplicates += 1;
            return false;
        }
        self.seen.insert(key.to_string())
    }

    /// Record an item by its identity key.
    pub fn admit<T: Item>(&mut self, item: &T) -> bool {
        self.insert(&item.identity_key())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Number of dropped repeats so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Sorted key snapshot, for persisting alongside a checkpoint.
    pub fn snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.seen.iter().cloned().collect();
        keys.sort_unstable();
        keys
    }
}
