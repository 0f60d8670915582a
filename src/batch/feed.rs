//! Pull-based item feeds consumed by the batch runner.

use crate::models::{AcquireError, Item};
use serde_json::Value;

/// An ordered, possibly remote, sequence of items.
///
/// Feeds that can reposition themselves expose a `bookmark` after every
/// item and accept it back in `restore`. Feeds that cannot are resumed by
/// positional replay instead.
#[allow(async_fn_in_trait)]
pub trait ItemFeed {
    type Item: Item;

    /// Next item, `None` once exhausted.
    async fn next_item(&mut self) -> Result<Option<Self::Item>, AcquireError>;

    /// Best-effort estimate of how many items the feed yields in total.
    fn total_hint(&self) -> Option<u64> {
        None
    }

    /// Position just after the last item handed out.
    fn bookmark(&self) -> Option<Value> {
        None
    }

    /// Reposition at `bookmark`. `Ok(false)` means the feed cannot restore.
    async fn restore(&mut self, bookmark: &Value) -> Result<bool, AcquireError> {
        let _ = bookmark;
        Ok(false)
    }
}

/// Feed over any in-memory iterator. Positional only.
pub struct IterFeed<I: Iterator> {
    iter: I,
    total: Option<u64>,
}

impl<I: Iterator> IterFeed<I> {
    pub fn new(items: impl IntoIterator<IntoIter = I>) -> Self {
        let iter = items.into_iter();
        let total = match iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower as u64),
            _ => None,
        };
        Self { iter, total }
    }
}

impl<I> ItemFeed for IterFeed<I>
where
    I: Iterator,
    I::Item: Item,
{
    type Item = I::Item;

    async fn next_item(&mut self) -> Result<Option<Self::Item>, AcquireError> {
        Ok(self.iter.next())
    }

    fn total_hint(&self) -> Option<u64> {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Key(u32);

    impl Item for Key {
        fn identity_key(&self) -> String {
            self.0.to_string()
        }
    }

    #[tokio::test]
    async fn test_iter_feed_yields_in_order() {
        let mut feed = IterFeed::new(vec![Key(1), Key(2)]);
        assert_eq!(feed.total_hint(), Some(2));
        assert_eq!(feed.next_item().await.unwrap().unwrap().0, 1);
        assert_eq!(feed.next_item().await.unwrap().unwrap().0, 2);
        assert!(feed.next_item().await.unwrap().is_none());
        assert!(feed.bookmark().is_none());
        assert!(!feed.restore(&Value::Null).await.unwrap());
    }

    #[tokio::test]
    async fn test_iter_feed_unknown_length() {
        let feed = IterFeed::new((0..).map(Key).filter(|k| k.0 % 2 == 0));
        assert_eq!(feed.total_hint(), None);
    }
}
