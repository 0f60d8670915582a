//! denn's Biomarkt market index.
//!
//! The whole index is one static JSON document, so the source is a single page.

use super::{Page, SourceAdapter, string_or_number};
use crate::client::HttpClient;
use crate::models::{AcquireError, DennsConfig, OpeningHours, Store};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub const DENNS_SOURCE: &str = "denns";

#[derive(Debug, Default, Deserialize)]
pub struct MarketIndex {
    #[serde(default)]
    result: IndexResult,
}

#[derive(Debug, Default, Deserialize)]
struct IndexResult {
    #[serde(default)]
    data: IndexData,
}

#[derive(Debug, Default, Deserialize)]
struct IndexData {
    #[serde(default)]
    markets: MarketNodes,
}

#[derive(Debug, Default, Deserialize)]
struct MarketNodes {
    #[serde(default)]
    nodes: Vec<DennsMarket>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DennsMarket {
    #[serde(default, deserialize_with = "string_or_number")]
    pub market_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub contact: Contact,
    #[serde(default)]
    pub opening_hours_market: Vec<WeekdayHours>,
    #[serde(default)]
    pub services: Services,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub city: String,
    /// Coordinates arrive as strings
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub google_profile_link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeekdayHours {
    #[serde(default)]
    pub weekday: String,
    #[serde(default)]
    pub open_from: String,
    #[serde(default)]
    pub open_until: String,
    pub open_from_second: Option<String>,
    pub open_until_second: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Services {
    #[serde(default)]
    pub general_info: Vec<String>,
    #[serde(default)]
    pub equipment: Vec<String>,
    #[serde(default)]
    pub assortment: Vec<String>,
}

impl MarketIndex {
    pub fn into_markets(self) -> Vec<DennsMarket> {
        self.result.data.markets.nodes
    }
}

fn parse_coordinate(value: Option<&str>) -> Option<f64> {
    value?.trim().parse().ok()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Weekday hours; a second interval (lunch break) becomes a second entry.
pub fn parse_weekday_hours(entries: &[WeekdayHours]) -> Vec<OpeningHours> {
    let mut hours = Vec::new();
    for entry in entries {
        if entry.weekday.is_empty() || entry.open_from.is_empty() || entry.open_until.is_empty() {
            continue;
        }
        hours.push(OpeningHours {
            day: entry.weekday.clone(),
            opens: entry.open_from.clone(),
            closes: entry.open_until.clone(),
        });
        if let (Some(from), Some(until)) = (
            non_empty(&entry.open_from_second),
            non_empty(&entry.open_until_second),
        ) {
            hours.push(OpeningHours {
                day: entry.weekday.clone(),
                opens: from,
                closes: until,
            });
        }
    }
    hours
}

pub fn parse_market(market: &DennsMarket) -> Option<Store> {
    if market.market_id.is_empty() {
        return None;
    }

    let address = &market.address;
    let mut store = Store::new(
        DENNS_SOURCE,
        &market.market_id,
        &market.name,
        &address.street,
        &address.zip,
        &address.city,
    );
    store.country_code = market.country_code.clone();
    store.latitude = parse_coordinate(address.lat.as_deref());
    store.longitude = parse_coordinate(address.lon.as_deref());
    store.phone = non_empty(&market.contact.phone);
    store.email = non_empty(&market.contact.email);
    store.website = non_empty(&address.google_profile_link);
    store.opening_hours = parse_weekday_hours(&market.opening_hours_market);

    let services = &market.services;
    store.services = services
        .general_info
        .iter()
        .chain(&services.equipment)
        .chain(&services.assortment)
        .cloned()
        .collect();
    Some(store)
}

/// Stores of `country` in the index.
pub fn parse_index(index: MarketIndex, country: &str) -> Vec<Store> {
    let markets = index.into_markets();
    let total = markets.len();
    let stores: Vec<Store> = markets
        .iter()
        .filter_map(parse_market)
        .filter(|s| s.country_code.eq_ignore_ascii_case(country))
        .collect();
    debug!(total, kept = stores.len(), country, "Parsed denn's market index");
    stores
}

pub struct DennsAdapter {
    http: Arc<HttpClient>,
    url: String,
    country: String,
}

impl DennsAdapter {
    pub fn new(http: Arc<HttpClient>, config: &DennsConfig) -> Self {
        Self {
            http,
            url: config.url.clone(),
            country: config.country.clone(),
        }
    }
}

impl SourceAdapter for DennsAdapter {
    type Item = Store;
    type Cursor = ();
    type Cache = ();

    fn source_id(&self) -> &str {
        DENNS_SOURCE
    }

    fn first_cursor(&self) {}

    async fn fetch_page(&self, _cursor: &()) -> Result<Page<Store, ()>, AcquireError> {
        let index: MarketIndex = self.http.get_json(&self.url, &[]).await?;
        let items = parse_index(index, &self.country);
        Ok(Page {
            total_hint: Some(items.len() as u64),
            ..Page::last(items)
        })
    }
}
