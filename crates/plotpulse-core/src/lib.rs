//! Canonical record model for PlotPulse collection runs.
//!
//! Extractors produce [`RawRecord`] variants, which are converted into a
//! [`RecordCandidate`] at the boundary and then normalized into the
//! [`NormalizedRecord`] that lands in the JSON-Lines output.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod normalize;
mod raw;
mod text;

pub use normalize::{
    calculate_quality_score, normalize_candidate, normalize_location, normalize_rate,
    validate_record, NormalizeContext, ValidationIssue,
};
pub use raw::{RawApiListing, RawCircleRate, RawPortalListing, RawRecord};
pub use text::{
    parse_area_text, parse_date_text, parse_price_text, parse_rate_text, slugify, title_case,
    AreaMeasure,
};

pub const CRATE_NAME: &str = "plotpulse-core";

/// Written into every record's metadata so the loader can tell output generations apart.
pub const SCRAPER_VERSION: &str = "1.0";

pub const SQFT_PER_SQM: f64 = 10.764;
pub const SQFT_PER_SQYD: f64 = 9.0;

/// Upper sanity bound for a rate in the unit it was supplied in.
pub const MAX_PLAUSIBLE_RATE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaUnit {
    Sqft,
    Sqm,
    Sqyd,
}

impl AreaUnit {
    /// Square feet contained in one unit.
    pub fn sqft_factor(self) -> f64 {
        match self {
            AreaUnit::Sqft => 1.0,
            AreaUnit::Sqm => SQFT_PER_SQM,
            AreaUnit::Sqyd => SQFT_PER_SQYD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Rejects non-finite values and the `0,0` placeholder some portals emit.
    pub fn new_checked(latitude: f64, longitude: f64) -> Option<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        if latitude == 0.0 && longitude == 0.0 {
            return None;
        }
        if latitude.abs() > 90.0 || longitude.abs() > 180.0 {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
        })
    }
}

/// Location fields exactly as an extractor found them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawLocation {
    pub state: Option<String>,
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub village: Option<String>,
    pub zone: Option<String>,
}

/// Trimmed, case-normalized location with empty parts dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub state: Option<String>,
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub village: Option<String>,
    pub zone: Option<String>,
}

/// A number as a portal supplied it: already numeric, or still text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Number(f64),
    Text(String),
}

impl RawNumber {
    pub fn parse(&self) -> Option<f64> {
        match self {
            RawNumber::Number(value) => value.is_finite().then_some(*value),
            RawNumber::Text(text) => parse_rate_text(text),
        }
    }
}

impl From<f64> for RawNumber {
    fn from(value: f64) -> Self {
        RawNumber::Number(value)
    }
}

impl From<&str> for RawNumber {
    fn from(value: &str) -> Self {
        RawNumber::Text(value.to_string())
    }
}

impl fmt::Display for RawNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawNumber::Number(value) => write!(f, "{value}"),
            RawNumber::Text(text) => f.write_str(text),
        }
    }
}

/// Rates in whichever units the source published them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SuppliedRates {
    pub per_sqft: Option<RawNumber>,
    pub per_sqm: Option<RawNumber>,
    pub per_sqyd: Option<RawNumber>,
}

impl SuppliedRates {
    pub fn per_sqft(value: f64) -> Self {
        Self {
            per_sqft: Some(RawNumber::Number(value)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.per_sqft.is_none() && self.per_sqm.is_none() && self.per_sqyd.is_none()
    }
}

/// A rate expressed in all three units, remembering which one was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateFields {
    pub rate_per_sqft: f64,
    pub rate_per_sqm: f64,
    pub rate_per_sqyd: f64,
    pub rate_unit: AreaUnit,
}

impl RateFields {
    pub fn from_unit(value: f64, unit: AreaUnit) -> Self {
        let per_sqft = value / unit.sqft_factor();
        let mut fields = Self {
            rate_per_sqft: per_sqft,
            rate_per_sqm: per_sqft * SQFT_PER_SQM,
            rate_per_sqyd: per_sqft * SQFT_PER_SQYD,
            rate_unit: unit,
        };
        // keep the supplied figure bit-exact
        match unit {
            AreaUnit::Sqft => fields.rate_per_sqft = value,
            AreaUnit::Sqm => fields.rate_per_sqm = value,
            AreaUnit::Sqyd => fields.rate_per_sqyd = value,
        }
        fields
    }

    pub fn supplied_rate(&self) -> f64 {
        match self.rate_unit {
            AreaUnit::Sqft => self.rate_per_sqft,
            AreaUnit::Sqm => self.rate_per_sqm,
            AreaUnit::Sqyd => self.rate_per_sqyd,
        }
    }
}

/// Listing-only context carried alongside the rate fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_inr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_sqft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
}

/// Canonical shape every raw variant converts into before normalization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordCandidate {
    pub location: RawLocation,
    pub property_type: Option<String>,
    pub rates: SuppliedRates,
    pub effective_date: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub source_url: Option<String>,
    pub listing: Option<ListingDetails>,
}

impl RecordCandidate {
    /// Free-text address worth sending to a geocoder, if the record has one.
    pub fn geocode_address(&self) -> Option<String> {
        let listing = self.listing.as_ref()?;
        listing
            .address
            .as_deref()
            .or(listing.locality.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }
}

/// The `raw_data` object of an output line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taluka: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_sqft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_sqm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_sqyd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_unit: Option<AreaUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingDetails>,
}

impl RecordData {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Coordinates::new_checked(self.latitude?, self.longitude?)
    }

    /// The rate in the unit it was supplied in, falling back to sqft, sqm, sqyd order.
    pub fn primary_rate(&self) -> Option<f64> {
        let by_unit = match self.rate_unit {
            Some(AreaUnit::Sqft) => self.rate_per_sqft,
            Some(AreaUnit::Sqm) => self.rate_per_sqm,
            Some(AreaUnit::Sqyd) => self.rate_per_sqyd,
            None => None,
        };
        by_unit
            .or(self.rate_per_sqft)
            .or(self.rate_per_sqm)
            .or(self.rate_per_sqyd)
            .filter(|v| v.is_finite())
    }

    /// Rebuilds a candidate view of an already-written record, e.g. for re-scoring.
    pub fn to_candidate(&self) -> RecordCandidate {
        RecordCandidate {
            location: RawLocation {
                state: self.state.clone(),
                district: self.district.clone(),
                taluka: self.taluka.clone(),
                village: self.village.clone(),
                zone: self.zone.clone(),
            },
            property_type: self.property_type.clone(),
            rates: SuppliedRates {
                per_sqft: self.rate_per_sqft.map(RawNumber::Number),
                per_sqm: self.rate_per_sqm.map(RawNumber::Number),
                per_sqyd: self.rate_per_sqyd.map(RawNumber::Number),
            },
            effective_date: self.effective_date.clone(),
            coordinates: self.coordinates(),
            source_url: self.source_url.clone(),
            listing: self.listing.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraper_version: Option<String>,
}

/// One JSON-Lines output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: String,
    pub collection_date: DateTime<Utc>,
    pub raw_data: RecordData,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_fields_derive_the_other_units() {
        let from_sqft = RateFields::from_unit(1_000.0, AreaUnit::Sqft);
        assert_eq!(from_sqft.rate_per_sqft, 1_000.0);
        assert!((from_sqft.rate_per_sqm - 10_764.0).abs() < 1e-6);
        assert!((from_sqft.rate_per_sqyd - 9_000.0).abs() < 1e-6);

        let from_sqm = RateFields::from_unit(10_764.0, AreaUnit::Sqm);
        assert!((from_sqm.rate_per_sqft - 1_000.0).abs() < 1e-6);
        assert!((from_sqm.rate_per_sqyd - 9_000.0).abs() < 1e-6);
        assert_eq!(from_sqm.supplied_rate(), 10_764.0);

        let from_sqyd = RateFields::from_unit(9_000.0, AreaUnit::Sqyd);
        assert!((from_sqyd.rate_per_sqft - 1_000.0).abs() < 1e-6);
        assert!((from_sqyd.rate_per_sqm - 10_764.0).abs() < 1e-6);
    }

    #[test]
    fn raw_numbers_accept_text_and_numbers() {
        assert_eq!(RawNumber::from(12.5).parse(), Some(12.5));
        assert_eq!(RawNumber::from("₹15,000/sqft").parse(), Some(15_000.0));
        assert_eq!(RawNumber::from("n/a").parse(), None);
        assert_eq!(RawNumber::Number(f64::NAN).parse(), None);
    }

    #[test]
    fn placeholder_coordinates_are_rejected() {
        assert!(Coordinates::new_checked(0.0, 0.0).is_none());
        assert!(Coordinates::new_checked(118.0, 73.8).is_none());
        assert!(Coordinates::new_checked(18.52, 73.85).is_some());
    }

    #[test]
    fn primary_rate_prefers_the_supplied_unit() {
        let data = RecordData {
            rate_per_sqft: Some(100.0),
            rate_per_sqm: Some(1_076.4),
            rate_per_sqyd: Some(900.0),
            rate_unit: Some(AreaUnit::Sqyd),
            ..RecordData::default()
        };
        assert_eq!(data.primary_rate(), Some(900.0));

        let untagged = RecordData {
            rate_per_sqm: Some(500.0),
            ..RecordData::default()
        };
        assert_eq!(untagged.primary_rate(), Some(500.0));
    }
}
