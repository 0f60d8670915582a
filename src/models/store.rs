//! Store records produced by source adapters.
//!
//! Epistemic foundation:
//! - K_i: A store is identified by `{source}_{store_id}`, unique within a run
//! - B_i: Every optional field may be missing on any given source
//! - I^B: Brand availability may be uncheckable → explicit `Unknown`

use super::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An acquired record the batch engine can deduplicate.
pub trait Item {
    /// Stable key, unique within a run.
    fn identity_key(&self) -> String;
}

/// Result of a two-phase availability check.
///
/// `Unknown` means the check could not be performed (context was never
/// established, or retries ran out). It never means "checked and negative".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Present,
    Absent,
    #[default]
    Unknown,
}

impl Availability {
    /// Interpret a hit count from a context-scoped query.
    pub fn from_hits(hits: u64) -> Self {
        if hits > 0 { Self::Present } else { Self::Absent }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present => write!(f, "present"),
            Self::Absent => write!(f, "absent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Regular opening hours for one weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    pub day: String,
    pub opens: String,
    pub closes: String,
}

/// A single retail location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    /// Source identifier (e.g. "rewe")
    pub source: String,
    /// Store id as assigned by the source
    pub store_id: String,
    pub name: String,
    pub street: String,
    pub postal_code: String,
    pub city: String,
    #[serde(default = "default_country")]
    pub country_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opening_hours: Vec<OpeningHours>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    /// Brand availability from secondary verification
    #[serde(default)]
    pub brand_availability: Availability,
    #[serde(default = "Utc::now")]
    pub scraped_at: DateTime<Utc>,
}

fn default_country() -> String {
    "DE".to_string()
}

impl Store {
    /// Create a store with the required fields set and everything else empty.
    pub fn new(
        source: impl Into<String>,
        store_id: impl Into<String>,
        name: impl Into<String>,
        street: impl Into<String>,
        postal_code: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            store_id: store_id.into(),
            name: name.into(),
            street: street.into(),
            postal_code: postal_code.into(),
            city: city.into(),
            country_code: default_country(),
            latitude: None,
            longitude: None,
            phone: None,
            email: None,
            website: None,
            opening_hours: Vec::new(),
            services: Vec::new(),
            brand_availability: Availability::Unknown,
            scraped_at: Utc::now(),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// Check required fields and coordinate ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("source", &self.source),
            ("store_id", &self.store_id),
            ("name", &self.name),
            ("street", &self.street),
            ("postal_code", &self.postal_code),
            ("city", &self.city),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(self.invalid(format!("missing {field}")));
            }
        }

        if let Some(lat) = self.latitude
            && !(-90.0..=90.0).contains(&lat)
        {
            return Err(self.invalid(format!("latitude {lat} out of range")));
        }
        if let Some(lon) = self.longitude
            && !(-180.0..=180.0).contains(&lon)
        {
            return Err(self.invalid(format!("longitude {lon} out of range")));
        }

        Ok(())
    }

    fn invalid(&self, reason: String) -> ValidationError {
        ValidationError {
            key: self.identity_key(),
            reason,
        }
    }
}

impl Item for Store {
    fn identity_key(&self) -> String {
        format!("{}_{}", self.source, self.store_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> Store {
        Store::new("rewe", "840123", "REWE Markt", "Hauptstr. 1", "10115", "Berlin")
    }

    #[test]
    fn test_identity_key() {
        assert_eq!(sample_store().identity_key(), "rewe_840123");
    }

    #[test]
    fn test_validate_required_fields() {
        assert!(sample_store().validate().is_ok());

        let mut store = sample_store();
        store.city = "  ".to_string();
        let err = store.validate().unwrap_err();
        assert_eq!(err.key, "rewe_840123");
        assert!(err.reason.contains("city"));
    }

    #[test]
    fn test_validate_coordinates() {
        let mut store = sample_store();
        store.latitude = Some(52.52);
        store.longitude = Some(13.40);
        assert!(store.validate().is_ok());

        store.latitude = Some(152.0);
        assert!(store.validate().is_err());
    }

    #[test]
    fn test_availability_from_hits() {
        assert_eq!(Availability::from_hits(3), Availability::Present);
        assert_eq!(Availability::from_hits(0), Availability::Absent);
        assert!(!Availability::Unknown.is_known());
    }

    #[test]
    fn test_store_serialization_defaults() {
        let json = r#"{"source":"denns","store_id":"1","name":"denn's","street":"A 1","postal_code":"01067","city":"Dresden"}"#;
        let store: Store = serde_json::from_str(json).unwrap();
        assert_eq!(store.country_code, "DE");
        assert_eq!(store.brand_availability, Availability::Unknown);
        assert!(store.opening_hours.is_empty());
    }
}
