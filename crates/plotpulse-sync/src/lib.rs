//! Collection runs: source registry, city codes, target expansion and the fetch/parse/write loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plotpulse_storage::{
    GeocodeCache, Geocoder, HttpSession, NominatimBackend, ReqwestTransport, TokioSleeper,
    DEFAULT_GEOCODER_URL, DEFAULT_GEOCODER_USER_AGENT,
};

mod city_codes;
mod discover;
mod pipeline;
mod registry;
mod targets;

pub use city_codes::{CityCode, CityCodeTable};
pub use discover::{
    discover_city_codes, extract_city_codes, write_city_code_table, CityDiscovery,
    AUTOSUGGEST_PATH, DEFAULT_SEARCH_TERMS,
};
pub use pipeline::{CollectionPipeline, CollectionReport, RunLimits, RunStatus, RunSummary};
pub use registry::{Pacing, PropertyTypeConfig, SourceConfig, SourceRegistry};
pub use targets::{expand_targets, SkippedTarget, TargetPlan};

pub const CRATE_NAME: &str = "plotpulse-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub output_dir: PathBuf,
    pub geocode_cache: PathBuf,
    pub http_timeout: Duration,
    pub geocoder_url: String,
    pub geocoder_user_agent: String,
    pub rng_seed: Option<u64>,
}

impl SyncConfig {
    /// Defaults laid out under one workspace root.
    pub fn for_workspace(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            sources_file: root.join("sources.yaml"),
            output_dir: root.join("raw_data"),
            geocode_cache: root.join("cache").join("geocoding_cache.json"),
            http_timeout: Duration::from_secs(30),
            geocoder_url: DEFAULT_GEOCODER_URL.to_string(),
            geocoder_user_agent: DEFAULT_GEOCODER_USER_AGENT.to_string(),
            rng_seed: None,
            workspace_root: root,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("PLOTPULSE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(&root);
        Self {
            sources_file: std::env::var("PLOTPULSE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            output_dir: std::env::var("PLOTPULSE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            geocode_cache: std::env::var("PLOTPULSE_GEOCODE_CACHE")
                .map(PathBuf::from)
                .unwrap_or(defaults.geocode_cache),
            http_timeout: std::env::var("PLOTPULSE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            geocoder_url: std::env::var("PLOTPULSE_GEOCODER_URL")
                .unwrap_or(defaults.geocoder_url),
            geocoder_user_agent: std::env::var("PLOTPULSE_GEOCODER_USER_AGENT")
                .unwrap_or(defaults.geocoder_user_agent),
            rng_seed: std::env::var("PLOTPULSE_RNG_SEED")
                .ok()
                .and_then(|v| v.parse().ok()),
            workspace_root: root,
        }
    }
}

/// Nominatim-backed geocoder with the on-disk cache from `config`.
pub async fn build_geocoder(config: &SyncConfig) -> Result<Geocoder> {
    let cache = GeocodeCache::load(&config.geocode_cache).await;
    let backend = NominatimBackend::new(
        &config.geocoder_url,
        &config.geocoder_user_agent,
        config.http_timeout,
    )
    .context("building geocoder backend")?;
    Ok(Geocoder::new(Arc::new(backend), cache, Arc::new(TokioSleeper)))
}

/// Runs the named sources, or every enabled source when none are named.
pub async fn run_collection_from_env(
    sources: &[String],
    limits: RunLimits,
) -> Result<CollectionReport> {
    let config = SyncConfig::from_env();
    let mut pipeline = CollectionPipeline::from_config(config)
        .await?
        .with_limits(limits);
    if sources.is_empty() {
        pipeline.run_all().await
    } else {
        pipeline.run_sources(sources).await
    }
}

/// Rediscovers `source_id`'s city codes with its pacing and rewrites the table.
///
/// Without `terms` the built-in search list is used; without `output` the
/// source's own `city_codes` file is replaced.
pub async fn discover_city_codes_from_env(
    source_id: &str,
    terms: &[String],
    output: Option<PathBuf>,
) -> Result<(CityDiscovery, PathBuf)> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.sources_file)?;
    let source = registry
        .get(source_id)
        .with_context(|| format!("unknown source {source_id}"))?;
    let output = match output {
        Some(path) => path,
        None => source
            .city_codes
            .as_ref()
            .map(|rel| config.workspace_root.join(rel))
            .with_context(|| format!("{source_id} has no city_codes file; pass --output"))?,
    };
    let terms: Vec<String> = if terms.is_empty() {
        DEFAULT_SEARCH_TERMS.iter().map(|t| t.to_string()).collect()
    } else {
        terms.to_vec()
    };

    let transport = ReqwestTransport::new(config.http_timeout)?;
    let mut session = HttpSession::new(
        source.source_id.clone(),
        &source.http_config(config.http_timeout, config.rng_seed),
        Arc::new(transport),
        Arc::new(TokioSleeper),
    );
    let discovery =
        discover_city_codes(&mut session, &source.base_url, &terms, source.max_retries).await?;
    write_city_code_table(&output, &discovery.table).await?;
    Ok((discovery, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_defaults_hang_off_the_root() {
        let config = SyncConfig::for_workspace("/srv/plotpulse");
        assert_eq!(config.sources_file, PathBuf::from("/srv/plotpulse/sources.yaml"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/plotpulse/raw_data"));
        assert_eq!(
            config.geocode_cache,
            PathBuf::from("/srv/plotpulse/cache/geocoding_cache.json")
        );
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.rng_seed, None);
    }

    #[tokio::test]
    async fn geocoder_builds_with_an_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::for_workspace(dir.path());
        config.geocode_cache = dir.path().join("missing.json");
        let geocoder = build_geocoder(&config).await.unwrap();
        assert!(geocoder.cache().is_empty());
        assert_eq!(geocoder.backend_calls(), 0);
    }
}
