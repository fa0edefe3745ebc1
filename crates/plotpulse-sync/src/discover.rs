//! Rebuilds the portal city-code table from the autosuggest endpoint.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use plotpulse_storage::{HttpSession, OutboundRequest};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::city_codes::{CityCode, CityCodeTable};

pub const AUTOSUGGEST_PATH: &str = "/mbsrp/homepageAutoSuggest";

/// Prefixes and full names of the cities worth asking about.
pub const DEFAULT_SEARCH_TERMS: &[&str] = &[
    "mum", "mumbai", "del", "delhi", "ban", "bangalore", "bengaluru", "hyd", "hyderabad", "che",
    "chennai", "pun", "pune", "kol", "kolkata", "ahm", "ahmedabad", "gur", "gurgaon", "noi",
    "noida", "far", "faridabad", "jaip", "jaipur", "luck", "lucknow", "kan", "kanpur", "nag",
    "nagpur", "ind", "indore", "thane", "navi", "koch", "kochi", "coim", "coimbatore", "vad",
    "vadodara", "sur", "surat", "vis", "visakhapatnam", "pat", "patna", "bhop", "bhopal", "lud",
    "ludhiana", "aga", "agra", "nas", "nashik", "meer", "meerut", "raj", "rajkot", "var",
    "varanasi", "amri", "amritsar", "raip", "raipur", "chand", "chandigarh", "jodh", "jodhpur",
    "mad", "madurai", "gwal", "gwalior", "jams", "jamshedpur", "bhub", "bhubaneswar", "bel",
    "belgaum", "mang", "mangalore", "mys", "mysore", "tir", "tirupati", "sal", "salem", "war",
    "warangal", "aur", "aurangabad", "kolhapur", "sat", "satara", "sang", "sangli", "sol",
    "solapur", "pan", "panvel", "kal", "kalyan", "bhi", "bhiwandi", "vas", "vasai", "vir", "virar",
];

#[derive(Debug, Clone)]
pub struct CityDiscovery {
    pub table: CityCodeTable,
    pub terms_queried: usize,
    /// Terms whose response could not be fetched or decoded.
    pub terms_failed: usize,
}

fn field_text(entry: &Value, key: &str) -> Option<String> {
    match entry.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// City suggestions in one autosuggest payload. Localities, states and
/// entries without a city code are ignored.
pub fn extract_city_codes(payload: &Value) -> Vec<CityCode> {
    let Some(locations) = payload
        .pointer("/locationMap/LOCATION")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    locations
        .iter()
        .filter(|loc| loc.get("suggestType").and_then(Value::as_str) == Some("city_name"))
        .filter_map(|loc| {
            let city_field = field_text(loc, "city")?;
            let city = field_text(loc, "result")?;
            // rfnum is the search code when present
            let code = field_text(loc, "rfnum").unwrap_or(city_field);
            Some(CityCode {
                city,
                code,
                state: field_text(loc, "stateName"),
            })
        })
        .collect()
}

/// Queries every term in order through `session`, so the source's pacing and
/// 429 policy apply. A failed term is logged and skipped; rate limiting ends
/// the discovery with an error.
pub async fn discover_city_codes(
    session: &mut HttpSession,
    base_url: &str,
    terms: &[String],
    max_retries: u32,
) -> Result<CityDiscovery> {
    let base_url = base_url.trim_end_matches('/');
    let url = format!("{base_url}{AUTOSUGGEST_PATH}");
    let mut found = Vec::new();
    let mut failed = 0usize;

    for (index, term) in terms.iter().enumerate() {
        let request = OutboundRequest::get(&url)
            .with_query("searchtxt", term.as_str())
            .with_query("city", "null")
            .with_header("Accept", "application/json")
            .with_header("Referer", format!("{base_url}/"));

        let response = match session.request(&request, max_retries).await {
            Ok(response) => response,
            Err(err) if err.is_rate_limited() => {
                return Err(err).with_context(|| format!("discovering city codes at {term:?}"));
            }
            Err(err) => {
                warn!(term = %term, error = %err, "autosuggest request failed");
                failed += 1;
                continue;
            }
        };
        let payload: Value = match serde_json::from_slice(&response.body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(term = %term, error = %err, "autosuggest response is not JSON");
                failed += 1;
                continue;
            }
        };

        let cities = extract_city_codes(&payload);
        debug!(
            term = %term,
            index = index + 1,
            of = terms.len(),
            cities = cities.len(),
            "autosuggest answered"
        );
        found.extend(cities);
    }

    let table = CityCodeTable::from_cities(found);
    info!(
        cities = table.len(),
        terms = terms.len(),
        failed,
        "city code discovery finished"
    );
    Ok(CityDiscovery {
        table,
        terms_queried: terms.len(),
        terms_failed: failed,
    })
}

/// Replaces the table file through a temp-file rename. An empty table is
/// refused so a blocked run cannot wipe the existing codes.
pub async fn write_city_code_table(path: &Path, table: &CityCodeTable) -> Result<()> {
    if table.is_empty() {
        bail!("no city codes discovered, leaving {} unchanged", path.display());
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let body = table.to_yaml_string()?;
    let temp_path = parent.join(format!(".{}.city-codes.tmp", Uuid::new_v4()));
    fs::write(&temp_path, body)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err)
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()));
    }
    info!(path = %path.display(), cities = table.len(), "city code table written");
    Ok(())
}
