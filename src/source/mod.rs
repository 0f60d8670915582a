//! Store sources.
//!
//! Epistemic foundation:
//! - K_i: Every source is a closed `SourceId` resolved to a feed at startup
//! - K_i: Remote sources page through a cursor; each page fetch is safe to repeat
//! - B_i: Enrichment and verification lookups will succeed (might fail)
//! - I^B: Whether a verification context "took" is only known from the response

mod denns;
mod file;
mod paged;
mod rewe;

pub use denns::*;
pub use file::*;
pub use paged::*;
pub use rewe::*;

use crate::batch::{ItemFeed, RetryPolicy};
use crate::client::HttpClient;
use crate::models::{AcquireError, Availability, Config, Item, Store};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// One page of raw items plus the cursor of the page after it.
#[derive(Debug, Clone)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    /// `None` once this was the last page
    pub next: Option<C>,
    /// Estimate of the total item count across all pages, if the source knows it
    pub total_hint: Option<u64>,
}

impl<T, C> Page<T, C> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next: None,
            total_hint: None,
        }
    }
}

/// A paginated source with optional two-phase per-item enrichment.
///
/// `fetch_page` and `enrich` are stateless lookups. Verification is a
/// stateful pair: `establish_context` scopes the remote session to one item,
/// then `query_context` asks a question inside that scope. The context never
/// carries over to another item.
#[allow(async_fn_in_trait)]
pub trait SourceAdapter {
    type Item: Item;
    type Cursor: Serialize + DeserializeOwned + Clone + fmt::Debug;
    /// Lookup results reused across items, owned by the driving feed.
    type Cache: Default;

    fn source_id(&self) -> &str;

    fn first_cursor(&self) -> Self::Cursor;

    async fn fetch_page(
        &self,
        cursor: &Self::Cursor,
    ) -> Result<Page<Self::Item, Self::Cursor>, AcquireError>;

    /// Primary enrichment. `Ok(None)` leaves the item as it is.
    async fn enrich(&self, item: &Self::Item) -> Result<Option<Self::Item>, AcquireError> {
        let _ = item;
        Ok(None)
    }

    fn supports_verification(&self) -> bool {
        false
    }

    /// Scope the remote session to `item`. `Ok(false)` means the server refused.
    async fn establish_context(&self, item: &Self::Item) -> Result<bool, AcquireError> {
        let _ = item;
        Ok(false)
    }

    /// Query inside the context established for the current item.
    async fn query_context(&self, cache: &mut Self::Cache) -> Result<Availability, AcquireError> {
        let _ = cache;
        Ok(Availability::Unknown)
    }

    /// Store the verification outcome on the item.
    fn record_verification(&self, item: &mut Self::Item, result: Availability) {
        let _ = (item, result);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

/// Every source this binary knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceId {
    Rewe,
    Denns,
    File,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Rewe, SourceId::Denns, SourceId::File];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rewe => "rewe",
            Self::Denns => "denns",
            Self::File => "file",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let known: Vec<_> = SourceId::ALL.iter().map(|id| id.as_str()).collect();
                format!("unknown source '{s}' (known: {})", known.join(", "))
            })
    }
}

/// Closed set of feeds, one variant per `SourceId`.
pub enum SourceFeed {
    Rewe(PagedFeed<ReweAdapter<HttpMarketApi>>),
    Denns(PagedFeed<DennsAdapter>),
    File(FileFeed),
}

impl ItemFeed for SourceFeed {
    type Item = Store;

    async fn next_item(&mut self) -> Result<Option<Store>, AcquireError> {
        match self {
            Self::Rewe(feed) => feed.next_item().await,
            Self::Denns(feed) => feed.next_item().await,
            Self::File(feed) => feed.next_item().await,
        }
    }

    fn total_hint(&self) -> Option<u64> {
        match self {
            Self::Rewe(feed) => feed.total_hint(),
            Self::Denns(feed) => feed.total_hint(),
            Self::File(feed) => feed.total_hint(),
        }
    }

    fn bookmark(&self) -> Option<Value> {
        match self {
            Self::Rewe(feed) => feed.bookmark(),
            Self::Denns(feed) => feed.bookmark(),
            Self::File(feed) => feed.bookmark(),
        }
    }

    async fn restore(&mut self, bookmark: &Value) -> Result<bool, AcquireError> {
        match self {
            Self::Rewe(feed) => feed.restore(bookmark).await,
            Self::Denns(feed) => feed.restore(bookmark).await,
            Self::File(feed) => feed.restore(bookmark).await,
        }
    }
}

/// Resolve `source` to its feed.
pub fn build_feed(
    source: SourceId,
    config: &Config,
    http: Arc<HttpClient>,
) -> Result<SourceFeed, AcquireError> {
    let policy = RetryPolicy::new(
        config.http.max_retries,
        config.batch.base_delay(),
        config.batch.max_delay(),
    );
    let pacing = config.http.request_interval();

    let feed = match source {
        SourceId::Rewe => {
            let rewe = &config.sources.rewe;
            let api = HttpMarketApi::new(http, &rewe.base_url);
            SourceFeed::Rewe(PagedFeed::new(ReweAdapter::new(api, rewe), policy, pacing))
        }
        SourceId::Denns => {
            let adapter = DennsAdapter::new(http, &config.sources.denns);
            SourceFeed::Denns(PagedFeed::new(adapter, policy, pacing))
        }
        SourceId::File => SourceFeed::File(FileFeed::open(&config.sources.file.path)?),
    };
    Ok(feed)
}

/// Accept identifiers that some APIs send as numbers and others as strings.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_roundtrip() {
        for id in SourceId::ALL {
            assert_eq!(id.to_string().parse::<SourceId>().unwrap(), id);
        }
        assert_eq!("REWE".parse::<SourceId>().unwrap(), SourceId::Rewe);
    }

    #[test]
    fn test_unknown_source_lists_known() {
        let err = "lidl".parse::<SourceId>().unwrap_err();
        assert!(err.contains("rewe, denns, file"));
    }

    #[test]
    fn test_string_or_number() {
        #[derive(Deserialize)]
        struct Id {
            #[serde(default, deserialize_with = "string_or_number")]
            id: String,
        }

        let parse = |s: &str| serde_json::from_str::<Id>(s).unwrap().id;
        assert_eq!(parse(r#"{"id": "540918"}"#), "540918");
        assert_eq!(parse(r#"{"id": 540918}"#), "540918");
        assert_eq!(parse(r#"{"id": null}"#), "");
        assert_eq!(parse("{}"), "");
    }

    #[test]
    fn test_build_file_feed_missing_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.sources.file.path = dir.path().join("missing.jsonl");
        let http = Arc::new(HttpClient::new(&config.http).unwrap());

        let result = build_feed(SourceId::File, &config, http);
        assert!(matches!(result, Err(AcquireError::Io { .. })));
    }
}
