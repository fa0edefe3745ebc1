use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::{
    title_case, AreaUnit, Location, NormalizedRecord, RateFields, RawLocation, RawNumber,
    RecordCandidate, RecordData, RecordMetadata, SuppliedRates, MAX_PLAUSIBLE_RATE,
    SCRAPER_VERSION, SQFT_PER_SQM,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationIssue {
    #[error("missing district")]
    MissingDistrict,
    #[error("missing rate information")]
    MissingRate,
    #[error("invalid rate format: {0}")]
    InvalidRateFormat(String),
    #[error("rate must be positive, got {0}")]
    NonPositiveRate(f64),
    #[error("rate seems unrealistic: {0}")]
    ImplausibleRate(f64),
    #[error("invalid effective date {0:?} (expected YYYY-MM-DD)")]
    InvalidEffectiveDate(String),
    #[error("effective date {0} is in the future")]
    FutureEffectiveDate(NaiveDate),
}

/// Per-run values stamped onto every record.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub source: String,
    pub collection_date: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub today: NaiveDate,
}

impl NormalizeContext {
    pub fn now(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source: source.into(),
            collection_date: now,
            scraped_at: now,
            today: now.date_naive(),
        }
    }
}

fn clean(value: Option<&str>, f: impl Fn(&str) -> String) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(f)
}

pub fn normalize_location(raw: &RawLocation) -> Location {
    Location {
        state: clean(raw.state.as_deref(), title_case),
        district: clean(raw.district.as_deref(), title_case),
        taluka: clean(raw.taluka.as_deref(), title_case),
        village: clean(raw.village.as_deref(), title_case),
        zone: clean(raw.zone.as_deref(), str::to_uppercase),
    }
}

fn parse_supplied(value: &RawNumber) -> Result<f64, ValidationIssue> {
    value
        .parse()
        .ok_or_else(|| ValidationIssue::InvalidRateFormat(value.to_string()))
}

/// Expands the supplied rate into all three units.
///
/// Unit precedence is sqft, sqm, sqyd. A sqm figure supplied alongside sqft is
/// kept as given rather than re-derived.
pub fn normalize_rate(supplied: &SuppliedRates) -> Result<Option<RateFields>, ValidationIssue> {
    if let Some(raw) = &supplied.per_sqft {
        let mut fields = RateFields::from_unit(parse_supplied(raw)?, AreaUnit::Sqft);
        if let Some(sqm) = supplied.per_sqm.as_ref().and_then(RawNumber::parse) {
            fields.rate_per_sqm = sqm;
        }
        return Ok(Some(fields));
    }
    if let Some(raw) = &supplied.per_sqm {
        return Ok(Some(RateFields::from_unit(parse_supplied(raw)?, AreaUnit::Sqm)));
    }
    if let Some(raw) = &supplied.per_sqyd {
        return Ok(Some(RateFields::from_unit(parse_supplied(raw)?, AreaUnit::Sqyd)));
    }
    Ok(None)
}

pub fn validate_record(record: &NormalizedRecord, today: NaiveDate) -> Result<(), Vec<ValidationIssue>> {
    let data = &record.raw_data;
    let mut issues = Vec::new();

    if data.district.as_deref().map_or(true, |d| d.trim().is_empty()) {
        issues.push(ValidationIssue::MissingDistrict);
    }

    match data.primary_rate() {
        None => issues.push(ValidationIssue::MissingRate),
        Some(rate) if rate <= 0.0 => issues.push(ValidationIssue::NonPositiveRate(rate)),
        Some(rate) if rate > MAX_PLAUSIBLE_RATE => {
            issues.push(ValidationIssue::ImplausibleRate(rate))
        }
        Some(_) => {}
    }

    if let Some(text) = data.effective_date.as_deref() {
        match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            Ok(date) if date > today => issues.push(ValidationIssue::FutureEffectiveDate(date)),
            Ok(_) => {}
            Err(_) => issues.push(ValidationIssue::InvalidEffectiveDate(text.to_string())),
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Completeness and consistency score in `[0, 1]`, rounded to two decimals.
pub fn calculate_quality_score(candidate: &RecordCandidate) -> f64 {
    let mut score: f64 = 1.0;

    if is_blank(candidate.location.village.as_deref()) {
        score -= 0.1;
    }
    if is_blank(candidate.location.zone.as_deref()) {
        score -= 0.1;
    }
    if candidate.coordinates.is_none() {
        score -= 0.2;
    }

    if let (Some(sqft), Some(sqm)) = (&candidate.rates.per_sqft, &candidate.rates.per_sqm) {
        match (sqft.parse(), sqm.parse()) {
            (Some(sqft), Some(sqm)) => {
                let expected = sqft * SQFT_PER_SQM;
                if expected <= 0.0 || ((expected - sqm).abs() / expected) > 0.1 {
                    score -= 0.2;
                }
            }
            _ => score -= 0.1,
        }
    }

    (score.max(0.0) * 100.0).round() / 100.0
}

/// Normalizes, scores and validates one candidate.
pub fn normalize_candidate(
    candidate: RecordCandidate,
    ctx: &NormalizeContext,
) -> Result<NormalizedRecord, Vec<ValidationIssue>> {
    let quality_score = calculate_quality_score(&candidate);
    let location = normalize_location(&candidate.location);
    let rates = normalize_rate(&candidate.rates).map_err(|issue| vec![issue])?;

    let raw_data = RecordData {
        state: location.state,
        district: location.district,
        taluka: location.taluka,
        village: location.village,
        zone: location.zone,
        property_type: clean(candidate.property_type.as_deref(), str::to_string),
        rate_per_sqft: rates.map(|r| r.rate_per_sqft),
        rate_per_sqm: rates.map(|r| r.rate_per_sqm),
        rate_per_sqyd: rates.map(|r| r.rate_per_sqyd),
        rate_unit: rates.map(|r| r.rate_unit),
        effective_date: clean(candidate.effective_date.as_deref(), str::to_string),
        source_url: clean(candidate.source_url.as_deref(), str::to_string),
        latitude: candidate.coordinates.map(|c| c.latitude),
        longitude: candidate.coordinates.map(|c| c.longitude),
        listing: candidate.listing,
    };

    let record = NormalizedRecord {
        source: ctx.source.clone(),
        collection_date: ctx.collection_date,
        raw_data,
        metadata: RecordMetadata {
            scraped_at: Some(ctx.scraped_at),
            quality_score: Some(quality_score),
            scraper_version: Some(SCRAPER_VERSION.to_string()),
        },
    };

    validate_record(&record, ctx.today)?;
    Ok(record)
}
