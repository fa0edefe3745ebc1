use chrono::{DateTime, NaiveDate, Utc};
use plotpulse_core::{
    calculate_quality_score, normalize_location, normalize_rate, NormalizedRecord,
};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Column values for one `staging_plot_data` insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingRow {
    pub source: String,
    pub collection_date: DateTime<Utc>,
    pub raw_data: Value,
    pub state: Option<String>,
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub village: Option<String>,
    pub property_type: Option<String>,
    pub zone: Option<String>,
    pub rate_per_sqft: Option<f64>,
    pub rate_per_sqm: Option<f64>,
    pub effective_date: Option<NaiveDate>,
    /// WKT `POINT(lon lat)`.
    pub location: Option<String>,
    pub data_quality_score: Option<f64>,
    pub dedup_key: String,
    pub source_url: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Derives the staging columns from a written record.
///
/// Location is re-normalized, missing rate units are filled in, and the
/// quality score is recomputed only when the record does not carry one.
pub fn extract_fields(record: &NormalizedRecord) -> StagingRow {
    let data = &record.raw_data;
    let candidate = data.to_candidate();
    let location = normalize_location(&candidate.location);
    let rates = normalize_rate(&candidate.rates).ok().flatten();
    let effective_date = data
        .effective_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());
    let point = data
        .coordinates()
        .map(|c| format!("POINT({} {})", c.longitude, c.latitude));
    let quality = record
        .metadata
        .quality_score
        .unwrap_or_else(|| calculate_quality_score(&candidate));
    let property_type = data
        .property_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut row = StagingRow {
        source: record.source.clone(),
        collection_date: record.collection_date,
        raw_data: serde_json::to_value(data).unwrap_or_default(),
        state: location.state,
        district: location.district,
        taluka: location.taluka,
        village: location.village,
        property_type,
        zone: location.zone,
        rate_per_sqft: rates.map(|r| r.rate_per_sqft),
        rate_per_sqm: rates.map(|r| r.rate_per_sqm),
        effective_date,
        location: point,
        data_quality_score: Some(quality),
        dedup_key: String::new(),
        source_url: data.source_url.clone(),
        scraped_at: record.metadata.scraped_at,
    };
    let listing_id = data.listing.as_ref().and_then(|l| l.listing_id.as_deref());
    row.dedup_key = dedup_key(&row, listing_id);
    row
}

/// SHA-256 over the fields that identify one rate observation.
///
/// Listings are identified by their portal id or URL, so the same listing
/// collected on two days collapses to one key.
pub fn dedup_key(row: &StagingRow, listing_id: Option<&str>) -> String {
    let lower = |v: &Option<String>| v.as_deref().unwrap_or_default().to_lowercase();
    let identity = listing_id
        .map(str::to_string)
        .or_else(|| row.source_url.clone())
        .unwrap_or_default();
    let parts = [
        row.source.clone(),
        lower(&row.state),
        lower(&row.district),
        lower(&row.taluka),
        lower(&row.village),
        lower(&row.zone),
        lower(&row.property_type),
        row.effective_date.map(|d| d.to_string()).unwrap_or_default(),
        row.rate_per_sqft.map(|r| format!("{r:.2}")).unwrap_or_default(),
        identity,
    ];

    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}
