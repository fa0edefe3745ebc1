use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use plotpulse_adapters::{AdapterSpec, CollectionTarget, Crawlability, ExtractorConfig, RequestTemplate};
use plotpulse_storage::{HttpClientConfig, PacingPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn default_delay_secs() -> f64 {
    2.0
}

fn default_variation_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pacing {
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,
    #[serde(default = "default_variation_secs")]
    pub variation_secs: f64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            delay_secs: default_delay_secs(),
            variation_secs: default_variation_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyTypeConfig {
    pub name: String,
    /// Portal code substituted for `{property_type_code}`.
    #[serde(default)]
    pub code: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub crawlability: Crawlability,
    pub base_url: String,
    #[serde(default)]
    pub pacing: Pacing,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// State stamped on targets, used by `{state}` and by geocoding.
    #[serde(default)]
    pub state: Option<String>,
    pub request: RequestTemplate,
    pub extractor: ExtractorConfig,
    /// Explicit target names; empty means every city of the city-code table.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub property_types: Vec<PropertyTypeConfig>,
    /// City-code table, relative to the workspace root.
    #[serde(default)]
    pub city_codes: Option<PathBuf>,
    #[serde(default)]
    pub max_targets: Option<usize>,
    #[serde(default)]
    pub geocode: bool,
    #[serde(default)]
    pub split_by_property_type: bool,
    /// Take a long pause between consecutive targets.
    #[serde(default)]
    pub break_between_targets: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn adapter_spec(&self) -> AdapterSpec {
        AdapterSpec {
            source_id: self.source_id.clone(),
            crawlability: self.crawlability,
            base_url: self.base_url.clone(),
            request: self.request.clone(),
            extractor: self.extractor.clone(),
        }
    }

    pub fn http_config(&self, timeout: Duration, rng_seed: Option<u64>) -> HttpClientConfig {
        HttpClientConfig {
            timeout,
            pacing: PacingPolicy::default().with_delay(
                Duration::from_secs_f64(self.pacing.delay_secs.max(0.0)),
                Duration::from_secs_f64(self.pacing.variation_secs.max(0.0)),
            ),
            rng_seed,
            ..HttpClientConfig::default()
        }
    }

    /// Whether any part of the request template needs `{city_code}`.
    pub fn requires_city_code(&self) -> bool {
        let needle = "{city_code}";
        let r = &self.request;
        r.url.contains(needle)
            || r.first_page_url.as_deref().is_some_and(|u| u.contains(needle))
            || r.query
                .values()
                .chain(r.form.values())
                .chain(r.headers.values())
                .any(|v| v.contains(needle))
    }

    /// Output stream a target's records are appended to.
    pub fn stream_for(&self, target: &CollectionTarget) -> String {
        match (&target.property_type, self.split_by_property_type) {
            (Some(kind), true) => format!("{}_{kind}", self.source_id),
            _ => self.source_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: telangana_dharani
    display_name: Telangana Dharani guidance values
    crawlability: public_html
    base_url: https://dharani.telangana.gov.in/
    pacing: { delay_secs: 3.0 }
    state: Telangana
    targets: [Hyderabad, Ranga Reddy]
    request:
      url: "{base_url}/homeGuidanceValue?district={name}"
    extractor:
      kind: html_rate_table
      min_cells: 4
      columns: { taluka: 0, village: 1, property_type: 2, rate_per_sqyd: 3, effective_date: 4 }
  - source_id: magicbricks_api
    display_name: Magicbricks search API
    enabled: false
    crawlability: api
    base_url: https://www.magicbricks.com
    max_pages: 5
    request:
      url: "{base_url}/mbsrp/propertySearch.html"
      query: { city: "{city_code}", page: "{page}" }
    extractor:
      kind: json_listing
    property_types:
      - { name: plot, code: "10003" }
      - { name: flat, code: "10001" }
    city_codes: data/magicbricks_city_codes.yaml
    split_by_property_type: true
"#;

    #[test]
    fn registry_parses_with_defaults() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);

        let dharani = registry.get("telangana_dharani").unwrap();
        assert_eq!(dharani.max_pages, 1);
        assert_eq!(dharani.max_retries, 3);
        assert_eq!(dharani.pacing.delay_secs, 3.0);
        assert_eq!(dharani.pacing.variation_secs, 1.0);
        assert!(!dharani.requires_city_code());
        assert!(matches!(dharani.extractor, ExtractorConfig::HtmlRateTable(_)));

        let api = registry.get("magicbricks_api").unwrap();
        assert!(api.requires_city_code());
        assert_eq!(api.property_types[0].code.as_deref(), Some("10003"));
    }

    #[test]
    fn streams_split_by_property_type_when_asked() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        let api = registry.get("magicbricks_api").unwrap();
        let mut target = CollectionTarget::new("magicbricks_api", "Pune");
        assert_eq!(api.stream_for(&target), "magicbricks_api");
        target.property_type = Some("plot".into());
        assert_eq!(api.stream_for(&target), "magicbricks_api_plot");

        let dharani = registry.get("telangana_dharani").unwrap();
        assert_eq!(dharani.stream_for(&target), "telangana_dharani");
    }

    #[test]
    fn shipped_registry_builds_every_adapter() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).unwrap();
        assert!(registry.get("telangana_dharani").is_some());
        assert!(registry.get("magicbricks_api").is_some_and(|s| s.requires_city_code()));
        for source in &registry.sources {
            plotpulse_adapters::adapter_for_source(&source.adapter_spec())
                .unwrap_or_else(|e| panic!("{}: {e}", source.source_id));
        }
    }

    #[test]
    fn pacing_flows_into_the_http_config() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        let config = registry
            .get("telangana_dharani")
            .unwrap()
            .http_config(Duration::from_secs(30), Some(1));
        assert_eq!(config.pacing.base_delay, Duration::from_secs(3));
        assert_eq!(config.pacing.variation, Duration::from_secs(1));
        assert_eq!(config.rng_seed, Some(1));
    }
}
