//! Source adapter contract and the configurable extractors behind it.

use chrono::{DateTime, Utc};
use plotpulse_core::{slugify, RawRecord};
use plotpulse_storage::{FetchedResponse, OutboundRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod html;
mod json;
mod template;

pub use html::{
    HtmlListingAdapter, HtmlListingConfig, HtmlRateTableAdapter, RateColumns, RateTableConfig,
};
pub use json::{JsonFieldKeys, JsonListingAdapter, JsonListingConfig};
pub use template::{render_placeholders, RequestTemplate};

pub const CRATE_NAME: &str = "plotpulse-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crawlability {
    PublicHtml,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn from_response(resp: &FetchedResponse, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: resp.final_url.clone(),
            content_type: resp.content_type().map(ToString::to_string),
            body: resp.body.clone(),
            fetched_at,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One city or district, for one property type, of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionTarget {
    pub source_id: String,
    pub name: String,
    pub state: Option<String>,
    pub property_type: Option<String>,
    pub property_type_code: Option<String>,
    pub city_code: Option<String>,
}

impl CollectionTarget {
    pub fn new(source_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            state: None,
            property_type: None,
            property_type_code: None,
            city_code: None,
        }
    }

    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn label(&self) -> String {
        match &self.property_type {
            Some(kind) => format!("{}/{kind}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedPage {
    pub records: Vec<RawRecord>,
    /// Whether the page indicates a further page exists.
    pub has_more: bool,
    /// Rows or cards that could not be turned into a record.
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("placeholder {{{0}}} has no value for this target")]
    MissingPlaceholder(String),
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid request url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("unsupported http method {0:?}")]
    InvalidMethod(String),
    #[error("expected a JSON response, got content type {0:?}")]
    UnexpectedContentType(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
}

/// Builds requests for a target and turns fetched pages into raw records.
///
/// Implementations hold no per-run state; the same adapter serves every target.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn crawlability(&self) -> Crawlability;
    fn build_request(
        &self,
        target: &CollectionTarget,
        page: u32,
    ) -> Result<OutboundRequest, AdapterError>;
    fn parse_page(
        &self,
        target: &CollectionTarget,
        page: &FetchedPage,
    ) -> Result<ParsedPage, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    HtmlListing(HtmlListingConfig),
    HtmlRateTable(RateTableConfig),
    JsonListing(JsonListingConfig),
}

/// Everything needed to construct one source's adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub source_id: String,
    pub crawlability: Crawlability,
    pub base_url: String,
    pub request: RequestTemplate,
    pub extractor: ExtractorConfig,
}

/// Request side shared by all adapters.
#[derive(Debug, Clone)]
pub(crate) struct RequestSide {
    pub(crate) source_id: String,
    pub(crate) crawlability: Crawlability,
    pub(crate) base_url: String,
    pub(crate) template: RequestTemplate,
}

impl RequestSide {
    pub(crate) fn from_spec(spec: &AdapterSpec) -> Self {
        Self {
            source_id: spec.source_id.clone(),
            crawlability: spec.crawlability,
            base_url: spec.base_url.trim_end_matches('/').to_string(),
            template: spec.request.clone(),
        }
    }

    pub(crate) fn build(
        &self,
        target: &CollectionTarget,
        page: u32,
    ) -> Result<OutboundRequest, AdapterError> {
        self.template.render(&self.base_url, target, page)
    }
}

/// Compiles selectors and builds the adapter for one registry entry.
pub fn adapter_for_source(spec: &AdapterSpec) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let side = RequestSide::from_spec(spec);
    Ok(match &spec.extractor {
        ExtractorConfig::HtmlListing(config) => Box::new(HtmlListingAdapter::new(side, config)?),
        ExtractorConfig::HtmlRateTable(config) => {
            Box::new(HtmlRateTableAdapter::new(side, config)?)
        }
        ExtractorConfig::JsonListing(config) => Box::new(JsonListingAdapter::new(side, config)),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use plotpulse_storage::Method;

    const SOURCES_SNIPPET: &str = r#"
source_id: magicbricks_api
crawlability: api
base_url: https://www.magicbricks.com/
request:
  url: "{base_url}/mbsrp/propertySearch.html"
  query:
    city: "{city_code}"
    propertyType: "{property_type_code}"
    page: "{page}"
    groupstart: "{offset}"
  page_size: 30
extractor:
  kind: json_listing
  results_key: resultList
  page_size_hint: 20
"#;

    #[test]
    fn spec_from_yaml_builds_a_json_adapter() {
        let spec: AdapterSpec = serde_yaml::from_str(SOURCES_SNIPPET).expect("spec parses");
        let adapter = adapter_for_source(&spec).expect("adapter");
        assert_eq!(adapter.source_id(), "magicbricks_api");
        assert_eq!(adapter.crawlability(), Crawlability::Api);

        let mut target = CollectionTarget::new("magicbricks_api", "Pune");
        target.city_code = Some("4378".into());
        target.property_type = Some("plot".into());
        target.property_type_code = Some("10003".into());

        let req = adapter.build_request(&target, 3).expect("request");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.url, "https://www.magicbricks.com/mbsrp/propertySearch.html");
        assert!(req.query.contains(&("city".to_string(), "4378".to_string())));
        assert!(req.query.contains(&("groupstart".to_string(), "60".to_string())));
        assert!(req.query.contains(&("page".to_string(), "3".to_string())));
    }

    #[test]
    fn missing_city_code_is_reported() {
        let spec: AdapterSpec = serde_yaml::from_str(SOURCES_SNIPPET).expect("spec parses");
        let adapter = adapter_for_source(&spec).expect("adapter");
        let target = CollectionTarget::new("magicbricks_api", "Kochi");

        let err = adapter.build_request(&target, 1).unwrap_err();
        assert!(matches!(err, AdapterError::MissingPlaceholder(ref name) if name == "city_code"));
    }

    #[test]
    fn bad_selectors_fail_at_construction() {
        let spec = AdapterSpec {
            source_id: "broken".into(),
            crawlability: Crawlability::PublicHtml,
            base_url: "https://example.test".into(),
            request: RequestTemplate::get("{base_url}/{slug}"),
            extractor: ExtractorConfig::HtmlListing(HtmlListingConfig {
                card: vec!["div[[".into()],
                ..HtmlListingConfig::default()
            }),
        };
        assert!(matches!(
            adapter_for_source(&spec),
            Err(AdapterError::InvalidSelector { .. })
        ));
    }
}
