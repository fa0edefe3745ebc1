//! Extractor for portals that answer searches with a JSON result list.

use plotpulse_core::{RawApiListing, RawRecord};
use plotpulse_storage::OutboundRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    AdapterError, CollectionTarget, Crawlability, FetchedPage, ParsedPage, RequestSide,
    SourceAdapter,
};

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

/// Candidate keys per field; the first key holding a usable value wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFieldKeys {
    pub id: Vec<String>,
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub price_text: Vec<String>,
    pub carpet_area: Vec<String>,
    pub land_area: Vec<String>,
    pub price_per_sqft: Vec<String>,
    pub locality: Vec<String>,
    pub address: Vec<String>,
    pub city: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    /// Keys holding `"lat,lng"` in one string.
    pub combined_coordinates: Vec<String>,
    pub url: Vec<String>,
    pub property_type: Vec<String>,
    pub posted_date: Vec<String>,
}

impl Default for JsonFieldKeys {
    fn default() -> Self {
        Self {
            id: keys(&["id", "encId"]),
            title: keys(&["propertyTitle", "seoDesc", "dtldesc"]),
            price: keys(&["price"]),
            price_text: keys(&["priceD"]),
            carpet_area: keys(&["ca", "caSqFt"]),
            land_area: keys(&["la"]),
            price_per_sqft: keys(&["sqFtPrice"]),
            locality: keys(&["locSeoName", "loc", "lmtDName"]),
            address: keys(&["defaultAdddressGoogle", "landmark", "propertyTitle"]),
            city: keys(&["ctName"]),
            latitude: keys(&["pmtLat"]),
            longitude: keys(&["pmtLong"]),
            combined_coordinates: keys(&["ltcoordGeo"]),
            url: keys(&["seoURL", "url"]),
            property_type: keys(&["propTypeD"]),
            posted_date: keys(&["postDateT"]),
        }
    }
}

fn default_results_key() -> String {
    "resultList".to_string()
}

fn default_page_size_hint() -> usize {
    20
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonListingConfig {
    /// Dotted path to the result array.
    #[serde(default = "default_results_key")]
    pub results_key: String,
    /// A page with fewer results than this is the last one.
    #[serde(default = "default_page_size_hint")]
    pub page_size_hint: usize,
    #[serde(default)]
    pub fields: JsonFieldKeys,
}

impl Default for JsonListingConfig {
    fn default() -> Self {
        Self {
            results_key: default_results_key(),
            page_size_hint: default_page_size_hint(),
            fields: JsonFieldKeys::default(),
        }
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |cur, segment| cur.get(segment))
}

fn json_str(value: &JsonValue, keys: &[String]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Numbers arrive both as JSON numbers and as numeric strings.
fn json_f64(value: &JsonValue, keys: &[String]) -> Option<f64> {
    keys.iter().find_map(|key| {
        let parsed = match value.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|v| v.is_finite() && *v != 0.0)
    })
}

fn split_coordinates(text: &str) -> Option<(f64, f64)> {
    let (lat, lng) = text.split_once(',')?;
    Some((lat.trim().parse().ok()?, lng.trim().parse().ok()?))
}

#[derive(Debug)]
pub struct JsonListingAdapter {
    side: RequestSide,
    config: JsonListingConfig,
}

impl JsonListingAdapter {
    pub(crate) fn new(side: RequestSide, config: &JsonListingConfig) -> Self {
        Self {
            side,
            config: config.clone(),
        }
    }

    fn listing_url(&self, raw: &str) -> String {
        if raw.starts_with("http") {
            raw.to_string()
        } else {
            format!("{}/{}", self.side.base_url, raw.trim_start_matches('/'))
        }
    }

    fn parse_listing(&self, item: &JsonValue, target: &CollectionTarget) -> Option<RawApiListing> {
        if !item.is_object() {
            return None;
        }
        let fields = &self.config.fields;
        let (latitude, longitude) = match (
            json_f64(item, &fields.latitude),
            json_f64(item, &fields.longitude),
        ) {
            (Some(lat), Some(lng)) => (Some(lat), Some(lng)),
            _ => json_str(item, &fields.combined_coordinates)
                .as_deref()
                .and_then(split_coordinates)
                .map_or((None, None), |(lat, lng)| (Some(lat), Some(lng))),
        };

        Some(RawApiListing {
            listing_id: json_str(item, &fields.id),
            title: json_str(item, &fields.title),
            price_amount: json_f64(item, &fields.price),
            price_text: json_str(item, &fields.price_text),
            carpet_area_sqft: json_f64(item, &fields.carpet_area),
            land_area_sqft: json_f64(item, &fields.land_area),
            price_per_sqft: json_f64(item, &fields.price_per_sqft),
            locality: json_str(item, &fields.locality),
            address: json_str(item, &fields.address),
            city: json_str(item, &fields.city).or_else(|| Some(target.name.clone())),
            district: None,
            state: target.state.clone(),
            latitude,
            longitude,
            listing_url: json_str(item, &fields.url).map(|u| self.listing_url(&u)),
            property_type_desc: json_str(item, &fields.property_type),
            property_type: target.property_type.clone(),
            posted_date: json_str(item, &fields.posted_date),
        })
    }
}

impl SourceAdapter for JsonListingAdapter {
    fn source_id(&self) -> &str {
        &self.side.source_id
    }

    fn crawlability(&self) -> Crawlability {
        self.side.crawlability
    }

    fn build_request(
        &self,
        target: &CollectionTarget,
        page: u32,
    ) -> Result<OutboundRequest, AdapterError> {
        self.side.build(target, page)
    }

    fn parse_page(
        &self,
        target: &CollectionTarget,
        page: &FetchedPage,
    ) -> Result<ParsedPage, AdapterError> {
        if page.body.iter().all(u8::is_ascii_whitespace) {
            debug!(url = %page.url, "empty response body");
            return Ok(ParsedPage::default());
        }
        let content_type = page.content_type.clone().unwrap_or_default();
        if !content_type.to_ascii_lowercase().contains("json") {
            return Err(AdapterError::UnexpectedContentType(content_type));
        }

        let payload: JsonValue = serde_json::from_slice(&page.body)
            .map_err(|e| AdapterError::InvalidJson(e.to_string()))?;
        let Some(results) = json_path(&payload, &self.config.results_key).and_then(JsonValue::as_array)
        else {
            debug!(url = %page.url, key = %self.config.results_key, "no result list in payload");
            return Ok(ParsedPage::default());
        };

        let mut parsed = ParsedPage::default();
        for item in results {
            match self.parse_listing(item, target) {
                Some(listing) => parsed.records.push(RawRecord::ApiListing(listing)),
                None => parsed.skipped += 1,
            }
        }
        parsed.has_more = results.len() >= self.config.page_size_hint;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_page;
    use crate::{adapter_for_source, AdapterSpec, ExtractorConfig, RequestTemplate};

    fn adapter() -> Box<dyn SourceAdapter> {
        adapter_for_source(&AdapterSpec {
            source_id: "magicbricks_api".into(),
            crawlability: Crawlability::Api,
            base_url: "https://www.magicbricks.com".into(),
            request: RequestTemplate::get("{base_url}/mbsrp/propertySearch.html"),
            extractor: ExtractorConfig::JsonListing(JsonListingConfig::default()),
        })
        .expect("adapter")
    }

    fn pune_plots() -> CollectionTarget {
        let mut target = CollectionTarget::new("magicbricks_api", "Pune");
        target.city_code = Some("4378".into());
        target.property_type = Some("plot".into());
        target.property_type_code = Some("10003".into());
        target
    }

    #[test]
    fn result_list_maps_onto_api_listings() {
        let page = fixture_page(
            "magicbricks-api/pune-plot-page-1.json",
            "https://www.magicbricks.com/mbsrp/propertySearch.html",
            "application/json;charset=UTF-8",
        );
        let parsed = adapter().parse_page(&pune_plots(), &page).unwrap();

        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.skipped, 1);
        // four entries is below the page-size hint
        assert!(!parsed.has_more);

        let RawRecord::ApiListing(first) = &parsed.records[0] else {
            panic!("expected an api listing");
        };
        assert_eq!(first.listing_id.as_deref(), Some("71234567"));
        assert_eq!(first.price_amount, Some(6_000_000.0));
        assert_eq!(first.land_area_sqft, Some(1_500.0));
        assert_eq!(first.latitude, Some(18.5912));
        assert_eq!(first.city.as_deref(), Some("Pune"));
        assert_eq!(
            first.listing_url.as_deref(),
            Some("https://www.magicbricks.com/plot-hinjewadi-pune-pdpid-4d4235303")
        );
        assert_eq!(first.property_type.as_deref(), Some("plot"));

        let RawRecord::ApiListing(second) = &parsed.records[1] else {
            panic!("expected an api listing");
        };
        // coordinates packed into one string, numbers sent as text
        assert_eq!(second.latitude, Some(18.6298));
        assert_eq!(second.longitude, Some(73.7997));
        assert_eq!(second.carpet_area_sqft, Some(2_000.0));
        assert_eq!(second.listing_id.as_deref(), Some("enc-88"));

        let RawRecord::ApiListing(third) = &parsed.records[2] else {
            panic!("expected an api listing");
        };
        assert_eq!(third.latitude, None);
        assert_eq!(third.price_amount, None);
        assert_eq!(third.price_per_sqft, Some(3_100.0));
    }

    #[test]
    fn full_pages_report_more() {
        let items: Vec<JsonValue> = (0..20)
            .map(|i| serde_json::json!({"id": i.to_string(), "price": 1_000_000}))
            .collect();
        let body = serde_json::to_vec(&serde_json::json!({ "resultList": items })).unwrap();
        let page = FetchedPage {
            url: "https://www.magicbricks.com/mbsrp/propertySearch.html".into(),
            content_type: Some("application/json".into()),
            body,
            fetched_at: chrono::Utc::now(),
        };
        let parsed = adapter().parse_page(&pune_plots(), &page).unwrap();
        assert_eq!(parsed.records.len(), 20);
        assert!(parsed.has_more);
    }

    #[test]
    fn html_answers_are_rejected() {
        let page = FetchedPage {
            url: "https://www.magicbricks.com/mbsrp/propertySearch.html".into(),
            content_type: Some("text/html; charset=UTF-8".into()),
            body: b"<html>captcha</html>".to_vec(),
            fetched_at: chrono::Utc::now(),
        };
        assert!(matches!(
            adapter().parse_page(&pune_plots(), &page),
            Err(AdapterError::UnexpectedContentType(ct)) if ct.starts_with("text/html")
        ));
    }

    #[test]
    fn empty_and_malformed_bodies() {
        let mut page = FetchedPage {
            url: "https://www.magicbricks.com/mbsrp/propertySearch.html".into(),
            content_type: Some("application/json".into()),
            body: b"  \n".to_vec(),
            fetched_at: chrono::Utc::now(),
        };
        assert_eq!(
            adapter().parse_page(&pune_plots(), &page).unwrap(),
            ParsedPage::default()
        );

        page.body = b"{\"resultList\": [".to_vec();
        assert!(matches!(
            adapter().parse_page(&pune_plots(), &page),
            Err(AdapterError::InvalidJson(_))
        ));

        page.body = b"{\"message\": \"no results\"}".to_vec();
        assert_eq!(
            adapter().parse_page(&pune_plots(), &page).unwrap(),
            ParsedPage::default()
        );
    }

    #[test]
    fn nested_result_paths_resolve() {
        let payload = serde_json::json!({"data": {"items": [1, 2]}});
        assert_eq!(json_path(&payload, "data.items").and_then(JsonValue::as_array).map(Vec::len), Some(2));
        assert!(json_path(&payload, "data.missing").is_none());
    }
}
