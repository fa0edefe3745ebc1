//! Address geocoding with a persistent, append-only cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use plotpulse_core::Coordinates;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::Sleeper;

pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org";
pub const DEFAULT_GEOCODER_USER_AGENT: &str = "PlotPulse Data Collector";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(String),
    #[error("geocoder returned status {0}")]
    Status(u16),
    #[error("unexpected geocoder response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait GeocodeBackend: Send + Sync {
    /// First match for a full free-text address, if any.
    async fn search(&self, full_address: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Clone)]
pub struct NominatimBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimBackend {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("building geocoder client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeocodeBackend for NominatimBackend {
    async fn search(&self, full_address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let resp = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("q", full_address),
                ("format", "json"),
                ("limit", "1"),
                ("countrycodes", "in"),
            ])
            .send()
            .await
            .map_err(|e| GeocodeError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GeocodeError::Status(resp.status().as_u16()));
        }

        let places: Vec<NominatimPlace> = resp
            .json()
            .await
            .map_err(|e| GeocodeError::Decode(e.to_string()))?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat = place
            .lat
            .parse::<f64>()
            .map_err(|e| GeocodeError::Decode(format!("lat {:?}: {e}", place.lat)))?;
        let lon = place
            .lon
            .parse::<f64>()
            .map_err(|e| GeocodeError::Decode(format!("lon {:?}: {e}", place.lon)))?;
        Ok(Coordinates::new_checked(lat, lon))
    }
}

/// `address[, city][, state], India`
pub fn full_address(address: &str, city: Option<&str>, state: Option<&str>) -> String {
    let mut parts = vec![address.trim()];
    parts.extend(city.map(str::trim).filter(|s| !s.is_empty()));
    parts.extend(state.map(str::trim).filter(|s| !s.is_empty()));
    parts.push("India");
    parts.join(", ")
}

pub fn cache_key(full_address: &str) -> String {
    full_address.trim().to_lowercase()
}

/// Address key to coordinates, mirrored to a single JSON file.
#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, Coordinates>,
}

impl GeocodeCache {
    /// Loads the cache file; a missing, unreadable or malformed file yields an empty cache.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, Coordinates>>(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "malformed geocode cache, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable geocode cache, starting empty");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "loaded geocode cache");
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Coordinates> {
        self.entries.get(key).copied()
    }

    /// Inserts one entry and rewrites the whole file via temp-file rename.
    pub async fn insert_and_persist(
        &mut self,
        key: String,
        coordinates: Coordinates,
    ) -> anyhow::Result<()> {
        self.entries.insert(key, coordinates);

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let body = serde_json::to_vec_pretty(&self.entries).context("serializing geocode cache")?;
        let temp_path = parent.join(format!(".{}.geocode.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp cache file {}", temp_path.display()))?;
        file.write_all(&body)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp cache {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

pub struct Geocoder {
    backend: Arc<dyn GeocodeBackend>,
    cache: GeocodeCache,
    sleeper: Arc<dyn Sleeper>,
    spacing: Duration,
    backend_calls: usize,
}

impl Geocoder {
    pub fn new(backend: Arc<dyn GeocodeBackend>, cache: GeocodeCache, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            backend,
            cache,
            sleeper,
            spacing: Duration::from_secs(1),
            backend_calls: 0,
        }
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn backend_calls(&self) -> usize {
        self.backend_calls
    }

    pub async fn geocode(
        &mut self,
        address: &str,
        city: Option<&str>,
        state: Option<&str>,
    ) -> Option<Coordinates> {
        if address.trim().is_empty() {
            return None;
        }
        let full = full_address(address, city, state);
        let key = cache_key(&full);
        if let Some(hit) = self.cache.get(&key) {
            debug!(address = %full, "geocode cache hit");
            return Some(hit);
        }

        self.backend_calls += 1;
        let result = self.backend.search(&full).await;
        // fixed spacing after every backend call
        self.sleeper.sleep(self.spacing).await;

        match result {
            Ok(Some(coordinates)) => {
                info!(
                    address = %full,
                    latitude = coordinates.latitude,
                    longitude = coordinates.longitude,
                    "geocoded"
                );
                if let Err(err) = self.cache.insert_and_persist(key, coordinates).await {
                    warn!(error = %err, "failed to persist geocode cache");
                }
                Some(coordinates)
            }
            Ok(None) => {
                debug!(address = %full, "no geocoding match");
                None
            }
            Err(err) => {
                warn!(address = %full, error = %err, "geocoding failed");
                None
            }
        }
    }

    pub async fn geocode_batch(
        &mut self,
        addresses: &[String],
        city: Option<&str>,
        state: Option<&str>,
    ) -> Vec<(String, Option<Coordinates>)> {
        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses.iter().filter(|a| !a.trim().is_empty()) {
            let coordinates = self.geocode(address, city, state).await;
            out.push((address.clone(), coordinates));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::tests::RecordingSleeper;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeBackend {
        queries: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl GeocodeBackend for FakeBackend {
        async fn search(&self, full_address: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.queries.lock().unwrap().push(full_address.to_string());
            if self.fail {
                return Err(GeocodeError::Status(503));
            }
            if full_address.starts_with("Nowhere") {
                return Ok(None);
            }
            Ok(Coordinates::new_checked(18.5204, 73.8567))
        }
    }

    #[test]
    fn full_address_skips_blank_parts() {
        assert_eq!(
            full_address("Baner Road", Some("Pune"), Some("Maharashtra")),
            "Baner Road, Pune, Maharashtra, India"
        );
        assert_eq!(full_address("Kondapur", None, Some(" ")), "Kondapur, India");
        assert_eq!(
            cache_key(" Baner Road, Pune, India "),
            "baner road, pune, india"
        );
    }

    #[tokio::test]
    async fn same_address_hits_the_backend_once() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache").join("geocode_cache.json");
        let backend = Arc::new(FakeBackend::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut geocoder = Geocoder::new(
            backend.clone(),
            GeocodeCache::load(&cache_path).await,
            sleeper.clone(),
        );

        let first = geocoder.geocode("Baner Road", Some("Pune"), None).await;
        let second = geocoder.geocode("  baner road ", Some("PUNE"), None).await;
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(backend.queries.lock().unwrap().len(), 1);
        assert_eq!(geocoder.backend_calls(), 1);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(1)]);

        // persisted immediately
        let reloaded = GeocodeCache::load(&cache_path).await;
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("baner road, pune, india").is_some());
    }

    #[tokio::test]
    async fn backend_calls_are_spaced_and_failures_yield_none() {
        let dir = tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend {
            fail: true,
            ..FakeBackend::default()
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut geocoder = Geocoder::new(
            backend,
            GeocodeCache::load(dir.path().join("cache.json")).await,
            sleeper.clone(),
        );

        let results = geocoder
            .geocode_batch(
                &["Gachibowli".to_string(), "".to_string(), "Madhapur".to_string()],
                Some("Hyderabad"),
                Some("Telangana"),
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, c)| c.is_none()));
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(1); 2]);
        assert!(geocoder.cache().is_empty());
    }

    #[tokio::test]
    async fn empty_address_and_no_match() {
        let dir = tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        let mut geocoder = Geocoder::new(
            backend.clone(),
            GeocodeCache::load(dir.path().join("cache.json")).await,
            Arc::new(RecordingSleeper::default()),
        );

        assert!(geocoder.geocode("   ", Some("Pune"), None).await.is_none());
        assert!(backend.queries.lock().unwrap().is_empty());
        assert!(geocoder.geocode("Nowhere Lane", None, None).await.is_none());
        assert!(geocoder.cache().is_empty());
    }

    #[tokio::test]
    async fn malformed_cache_file_is_treated_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("geocode_cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut cache = GeocodeCache::load(&path).await;
        assert!(cache.is_empty());

        cache
            .insert_and_persist(
                "kondapur, hyderabad, india".into(),
                Coordinates::new_checked(17.46, 78.36).unwrap(),
            )
            .await
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: BTreeMap<String, Coordinates> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["kondapur, hyderabad, india"].latitude, 17.46);
    }
}
