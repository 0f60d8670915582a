//! REWE markets with a per-market brand availability check.
//!
//! Epistemic foundation:
//! - K_i: Market search is keyed by a free search term (state, city, postal code)
//! - K_i: Product queries are scoped to the market selected in the session cookie
//! - K_i: Selection succeeded iff the server answers 201
//! - B_i: Search results carry coordinates (sometimes missing)
//! - I^B: A zero count after a refused selection says nothing about the market

use super::{Page, SourceAdapter, string_or_number};
use crate::client::HttpClient;
use crate::models::{AcquireError, Availability, OpeningHours, ReweConfig, Store};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const REWE_SOURCE: &str = "rewe";

// ═══════════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSearchResponse {
    #[serde(default)]
    pub markets: Vec<Market>,
    #[serde(default)]
    pub total_hits: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    #[serde(default, deserialize_with = "string_or_number")]
    pub ww_ident: String,
    #[serde(default, alias = "marketName")]
    pub name: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub opening_info: Vec<OpeningInfo>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpeningInfo {
    #[serde(default)]
    pub opening_type: String,
    #[serde(default)]
    pub days: String,
    #[serde(default)]
    pub hours: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarketSelection<'a> {
    selected_service: &'a str,
    customer_zip_code: Option<&'a str>,
    ww_ident: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    #[serde(default)]
    total_hits: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    products: Vec<Product>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub brand: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════════

/// Map a search hit onto a `Store`. `None` when the market has no id.
pub fn parse_market(market: &Market) -> Option<Store> {
    if market.ww_ident.is_empty() {
        return None;
    }

    let name = match market.company_name.as_deref() {
        Some(company) if !company.is_empty() && company != market.name => {
            format!("{} ({company})", market.name)
        }
        _ => market.name.clone(),
    };

    let mut store = Store::new(
        REWE_SOURCE,
        &market.ww_ident,
        name,
        &market.street,
        &market.zip_code,
        &market.city,
    );
    if let Some(location) = market.location {
        store.latitude = location.latitude;
        store.longitude = location.longitude;
    }
    store.opening_hours = parse_opening_hours(&market.opening_info);
    Some(store)
}

/// Regular opening hours; `"07:00 - 22:00"` is split into opens/closes.
pub fn parse_opening_hours(entries: &[OpeningInfo]) -> Vec<OpeningHours> {
    entries
        .iter()
        .filter(|e| e.opening_type == "REGULAR" && !e.days.is_empty() && !e.hours.is_empty())
        .map(|e| {
            let (opens, closes) = match e.hours.split_once('-') {
                Some((from, until)) => (from.trim().to_string(), until.trim().to_string()),
                None => (e.hours.trim().to_string(), String::new()),
            };
            OpeningHours {
                day: e.days.clone(),
                opens,
                closes,
            }
        })
        .collect()
}

/// Catalog products of `brand` (case-insensitive).
pub fn filter_brand(products: Vec<Product>, brand: &str) -> Vec<Product> {
    products
        .into_iter()
        .filter(|p| {
            p.brand
                .as_deref()
                .is_some_and(|b| b.trim().eq_ignore_ascii_case(brand))
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════

/// The REWE endpoints the adapter depends on.
#[allow(async_fn_in_trait)]
pub trait MarketApi {
    async fn search_markets(&self, term: &str) -> Result<MarketSearchResponse, AcquireError>;

    /// Select `market_id` for the session. `Ok(false)` if the server did not accept it.
    async fn select_market(&self, market_id: &str) -> Result<bool, AcquireError>;

    /// Product hits for `query` in the selected market.
    async fn product_count(&self, query: &str) -> Result<u64, AcquireError>;

    async fn search_products(&self, query: &str, page: u32) -> Result<Vec<Product>, AcquireError>;
}

/// `MarketApi` over HTTP. Session context lives in the client's cookie store.
pub struct HttpMarketApi {
    http: Arc<HttpClient>,
    base_url: String,
}

impl HttpMarketApi {
    pub fn new(http: Arc<HttpClient>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl MarketApi for HttpMarketApi {
    async fn search_markets(&self, term: &str) -> Result<MarketSearchResponse, AcquireError> {
        self.http
            .get_json(&self.url("/api/wksmarketsearch"), &[("searchTerm", term)])
            .await
    }

    async fn select_market(&self, market_id: &str) -> Result<bool, AcquireError> {
        let body = MarketSelection {
            selected_service: "STATIONARY",
            customer_zip_code: None,
            ww_ident: market_id,
        };
        let status = self
            .http
            .post_json(&self.url("/api/wksmarketselection/userselections"), &body)
            .await?;
        Ok(status == StatusCode::CREATED)
    }

    async fn product_count(&self, query: &str) -> Result<u64, AcquireError> {
        let response: CountResponse = self
            .http
            .get_json(
                &self.url("/api/stationary-product-search/products/count"),
                &[("query", query)],
            )
            .await?;
        Ok(response.total_hits)
    }

    async fn search_products(&self, query: &str, page: u32) -> Result<Vec<Product>, AcquireError> {
        let page = page.to_string();
        let response: ProductsResponse = self
            .http
            .get_json(
                &self.url("/api/stationary-product-search/products"),
                &[("query", query), ("page", page.as_str())],
            )
            .await?;
        Ok(response.products)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Adapter
// ═══════════════════════════════════════════════════════════════════════════

/// Brand catalog, fetched once per feed.
#[derive(Debug, Default)]
pub struct BrandCatalog {
    pub products: Option<Vec<Product>>,
}

/// One page per search term; coordinates backfilled by postal code search;
/// brand availability via market selection + product count.
pub struct ReweAdapter<M> {
    api: M,
    search_terms: Vec<String>,
    verify: bool,
    query: String,
    brand: String,
}

impl<M: MarketApi> ReweAdapter<M> {
    pub fn new(api: M, config: &ReweConfig) -> Self {
        Self {
            api,
            search_terms: config.search_terms.clone(),
            verify: config.verify,
            query: config.verification_query.clone(),
            brand: config.brand.clone(),
        }
    }

    pub fn api(&self) -> &M {
        &self.api
    }

    async fn brand_catalog<'c>(
        &self,
        cache: &'c mut BrandCatalog,
    ) -> Result<&'c [Product], AcquireError> {
        if cache.products.is_none() {
            let products = self.api.search_products(&self.query, 1).await?;
            let catalog = filter_brand(products, &self.brand);
            debug!(brand = %self.brand, products = catalog.len(), "Loaded brand catalog");
            cache.products = Some(catalog);
        }
        Ok(cache.products.as_deref().unwrap_or_default())
    }
}

impl<M: MarketApi> SourceAdapter for ReweAdapter<M> {
    type Item = Store;
    type Cursor = usize;
    type Cache = BrandCatalog;

    fn source_id(&self) -> &str {
        REWE_SOURCE
    }

    fn first_cursor(&self) -> usize {
        0
    }

    async fn fetch_page(&self, cursor: &usize) -> Result<Page<Store, usize>, AcquireError> {
        let Some(term) = self.search_terms.get(*cursor) else {
            return Ok(Page::last(Vec::new()));
        };

        let response = self.api.search_markets(term).await?;
        let mut items = Vec::with_capacity(response.markets.len());
        for market in &response.markets {
            match parse_market(market) {
                Some(store) => items.push(store),
                None => warn!(term, "Skipping market without id"),
            }
        }

        Ok(Page {
            items,
            next: (*cursor + 1 < self.search_terms.len()).then_some(*cursor + 1),
            total_hint: None,
        })
    }

    async fn enrich(&self, store: &Store) -> Result<Option<Store>, AcquireError> {
        if store.has_coordinates() || store.postal_code.is_empty() {
            return Ok(None);
        }

        let response = self.api.search_markets(&store.postal_code).await?;
        let location = response
            .markets
            .iter()
            .filter(|m| m.ww_ident == store.store_id)
            .find_map(|m| m.location)
            .filter(|l| l.latitude.is_some() && l.longitude.is_some());

        Ok(location.map(|l| Store {
            latitude: l.latitude,
            longitude: l.longitude,
            ..store.clone()
        }))
    }

    fn supports_verification(&self) -> bool {
        self.verify
    }

    async fn establish_context(&self, store: &Store) -> Result<bool, AcquireError> {
        self.api.select_market(&store.store_id).await
    }

    async fn query_context(&self, cache: &mut BrandCatalog) -> Result<Availability, AcquireError> {
        let hits = self
            .api
            .product_count(&format!("\"{}\"", self.query))
            .await?;
        if hits > 0 {
            match self.brand_catalog(cache).await {
                Ok(catalog) => debug!(hits, catalog = catalog.len(), "Brand listed at market"),
                Err(e) => warn!(error = %e, "Brand catalog unavailable"),
            }
        }
        Ok(Availability::from_hits(hits))
    }

    fn record_verification(&self, store: &mut Store, result: Availability) {
        store.brand_availability = result;
    }
}
