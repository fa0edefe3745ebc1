//! Per-schema raw records as extractors emit them.

use serde::{Deserialize, Serialize};

use crate::{
    parse_area_text, parse_date_text, parse_price_text, Coordinates, ListingDetails, RawLocation,
    RawNumber, RecordCandidate, SuppliedRates,
};

/// One extracted item, tagged by the schema of the page it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum RawRecord {
    PortalListing(RawPortalListing),
    ApiListing(RawApiListing),
    CircleRate(RawCircleRate),
}

/// A listing card scraped from a portal search page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPortalListing {
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub area_text: Option<String>,
    pub area_sqft: Option<f64>,
    pub location_text: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub listing_url: Option<String>,
    pub property_type: Option<String>,
}

/// One entry of a portal's JSON search response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawApiListing {
    pub listing_id: Option<String>,
    pub title: Option<String>,
    pub price_amount: Option<f64>,
    pub price_text: Option<String>,
    pub carpet_area_sqft: Option<f64>,
    pub land_area_sqft: Option<f64>,
    pub price_per_sqft: Option<f64>,
    pub locality: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub listing_url: Option<String>,
    pub property_type_desc: Option<String>,
    /// Property type the search was issued for.
    pub property_type: Option<String>,
    pub posted_date: Option<String>,
}

/// A row of a government circle-rate table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCircleRate {
    pub state: Option<String>,
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub village: Option<String>,
    pub zone: Option<String>,
    pub property_type: Option<String>,
    pub rate_per_sqft: Option<RawNumber>,
    pub rate_per_sqm: Option<RawNumber>,
    pub rate_per_sqyd: Option<RawNumber>,
    pub effective_date: Option<String>,
    pub source_url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn price_per_sqft(price: Option<f64>, area_sqft: Option<f64>) -> Option<f64> {
    Some(positive(price)? / positive(area_sqft)?)
}

/// Maps a portal's free-text property description onto `plot` or `flat`.
fn classify_property_type(desc: &str) -> Option<&'static str> {
    let desc = desc.to_lowercase();
    if desc.contains("plot") || desc.contains("land") {
        Some("plot")
    } else if desc.contains("flat") || desc.contains("apartment") || desc.contains("bhk") {
        Some("flat")
    } else {
        None
    }
}

impl RawRecord {
    /// Portal identity used to drop repeats inside one target.
    pub fn listing_id(&self) -> Option<&str> {
        match self {
            RawRecord::PortalListing(listing) => listing.listing_url.as_deref(),
            RawRecord::ApiListing(listing) => listing.listing_id.as_deref(),
            RawRecord::CircleRate(_) => None,
        }
    }

    pub fn property_type(&self) -> Option<String> {
        match self {
            RawRecord::PortalListing(listing) => non_empty(listing.property_type.clone()),
            RawRecord::ApiListing(listing) => listing.resolved_property_type(),
            RawRecord::CircleRate(row) => non_empty(row.property_type.clone()),
        }
    }

    pub fn into_candidate(self) -> RecordCandidate {
        match self {
            RawRecord::PortalListing(listing) => listing.into_candidate(),
            RawRecord::ApiListing(listing) => listing.into_candidate(),
            RawRecord::CircleRate(row) => row.into_candidate(),
        }
    }
}

impl RawPortalListing {
    fn into_candidate(self) -> RecordCandidate {
        let price_inr = self.price_text.as_deref().and_then(parse_price_text);
        let area_sqft = positive(self.area_sqft).or_else(|| {
            self.area_text
                .as_deref()
                .and_then(parse_area_text)
                .map(|m| m.to_sqft())
        });
        let rate = price_per_sqft(price_inr, area_sqft);

        RecordCandidate {
            location: RawLocation {
                state: non_empty(self.state),
                district: non_empty(self.district).or_else(|| non_empty(self.city)),
                ..RawLocation::default()
            },
            property_type: non_empty(self.property_type),
            rates: SuppliedRates {
                per_sqft: rate.map(RawNumber::Number),
                ..SuppliedRates::default()
            },
            effective_date: None,
            coordinates: None,
            source_url: self.listing_url.clone(),
            listing: Some(ListingDetails {
                listing_id: None,
                title: non_empty(self.title),
                price_inr,
                price_text: non_empty(self.price_text),
                area_sqft,
                locality: non_empty(self.location_text),
                address: None,
                listing_url: self.listing_url,
                posted_date: None,
            }),
        }
    }
}

impl RawApiListing {
    fn resolved_property_type(&self) -> Option<String> {
        self.property_type_desc
            .as_deref()
            .and_then(classify_property_type)
            .map(str::to_string)
            .or_else(|| non_empty(self.property_type.clone()))
    }

    fn into_candidate(self) -> RecordCandidate {
        let property_type = self.resolved_property_type();
        let carpet = positive(self.carpet_area_sqft);
        let land = positive(self.land_area_sqft);
        let area_sqft = match property_type.as_deref() {
            Some("plot") => land.or(carpet),
            _ => carpet.or(land),
        };
        let price_inr = positive(self.price_amount)
            .or_else(|| self.price_text.as_deref().and_then(parse_price_text));
        let rate = price_per_sqft(price_inr, area_sqft).or(positive(self.price_per_sqft));
        let coordinates = match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Coordinates::new_checked(lat, lng),
            _ => None,
        };

        RecordCandidate {
            location: RawLocation {
                state: non_empty(self.state),
                district: non_empty(self.district).or_else(|| non_empty(self.city)),
                ..RawLocation::default()
            },
            property_type,
            rates: SuppliedRates {
                per_sqft: rate.map(RawNumber::Number),
                ..SuppliedRates::default()
            },
            effective_date: None,
            coordinates,
            source_url: self.listing_url.clone(),
            listing: Some(ListingDetails {
                listing_id: non_empty(self.listing_id),
                title: non_empty(self.title),
                price_inr,
                price_text: non_empty(self.price_text),
                area_sqft,
                locality: non_empty(self.locality),
                address: non_empty(self.address),
                listing_url: self.listing_url,
                posted_date: non_empty(self.posted_date),
            }),
        }
    }
}

impl RawCircleRate {
    fn into_candidate(self) -> RecordCandidate {
        // tables print DD-MM-YYYY and friends; text that is not a date is dropped
        let effective_date = self
            .effective_date
            .as_deref()
            .and_then(parse_date_text)
            .map(|d| d.format("%Y-%m-%d").to_string());

        RecordCandidate {
            location: RawLocation {
                state: self.state,
                district: self.district,
                taluka: self.taluka,
                village: self.village,
                zone: self.zone,
            },
            property_type: non_empty(self.property_type),
            rates: SuppliedRates {
                per_sqft: self.rate_per_sqft,
                per_sqm: self.rate_per_sqm,
                per_sqyd: self.rate_per_sqyd,
            },
            effective_date,
            coordinates: None,
            source_url: self.source_url,
            listing: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_listing_parses_area_text_when_sqft_missing() {
        let candidate = RawRecord::PortalListing(RawPortalListing {
            price_text: Some("₹ 1.35 Cr".into()),
            area_text: Some("150 sq.yd".into()),
            city: Some("Hyderabad".into()),
            property_type: Some("plot".into()),
            ..RawPortalListing::default()
        })
        .into_candidate();

        assert_eq!(candidate.location.district.as_deref(), Some("Hyderabad"));
        let rate = candidate.rates.per_sqft.unwrap().parse().unwrap();
        assert!((rate - 13_500_000.0 / 1_350.0).abs() < 1e-6);
        assert_eq!(candidate.listing.unwrap().area_sqft, Some(1_350.0));
    }

    #[test]
    fn api_listing_prefers_land_area_for_plots() {
        let listing = RawApiListing {
            listing_id: Some("71234567".into()),
            price_amount: Some(6_000_000.0),
            carpet_area_sqft: Some(900.0),
            land_area_sqft: Some(1_500.0),
            property_type_desc: Some("Residential Plot".into()),
            city: Some("Pune".into()),
            latitude: Some(18.59),
            longitude: Some(73.74),
            ..RawApiListing::default()
        };
        let record = RawRecord::ApiListing(listing);
        assert_eq!(record.listing_id(), Some("71234567"));
        assert_eq!(record.property_type().as_deref(), Some("plot"));

        let candidate = record.into_candidate();
        assert_eq!(candidate.rates.per_sqft, Some(RawNumber::Number(4_000.0)));
        assert!(candidate.coordinates.is_some());
    }

    #[test]
    fn api_listing_falls_back_to_portal_rate() {
        let candidate = RawRecord::ApiListing(RawApiListing {
            price_text: Some("Price on Request".into()),
            price_per_sqft: Some(5_200.0),
            property_type_desc: Some("2 BHK Flat".into()),
            latitude: Some(0.0),
            longitude: Some(0.0),
            ..RawApiListing::default()
        })
        .into_candidate();

        assert_eq!(candidate.property_type.as_deref(), Some("flat"));
        assert_eq!(candidate.rates.per_sqft, Some(RawNumber::Number(5_200.0)));
        assert!(candidate.coordinates.is_none());
    }

    #[test]
    fn circle_rate_dates_become_iso() {
        let candidate = RawRecord::CircleRate(RawCircleRate {
            district: Some("Hyderabad".into()),
            rate_per_sqyd: Some("12,500".into()),
            effective_date: Some("01-04-2023".into()),
            ..RawCircleRate::default()
        })
        .into_candidate();
        assert_eq!(candidate.effective_date.as_deref(), Some("2023-04-01"));

        let odd = RawRecord::CircleRate(RawCircleRate {
            effective_date: Some("current".into()),
            ..RawCircleRate::default()
        })
        .into_candidate();
        assert_eq!(odd.effective_date, None);
    }

    #[test]
    fn raw_records_carry_a_schema_tag() {
        let json = serde_json::json!({
            "schema": "circle_rate",
            "district": "Pune",
            "rate_per_sqm": 48200
        });
        let record: RawRecord = serde_json::from_value(json).unwrap();
        match record {
            RawRecord::CircleRate(row) => {
                assert_eq!(row.rate_per_sqm, Some(RawNumber::Number(48_200.0)));
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }
}
