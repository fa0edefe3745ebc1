//! Free-text parsing for prices, areas, rates and dates as portals print them.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::AreaUnit;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("number regex"));

// Anchored on the digit so compact forms like `50Lakh` or `1.2Cr` match.
static CRORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\d\s*(?:crores?|cr)\b").expect("crore regex"));

static LAKH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\d\s*(?:lakhs?|lacs?|l)\b").expect("lakh regex"));

static AREA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(sq\.?\s?(?:ft|feet)|sq\.?\s?(?:yd|yards?)|sq\.?\s?(?:m|mtrs?|meters?|metres?))\b",
    )
    .expect("area regex")
});

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(20\d{2})\b").expect("year regex"));

const DATE_FORMATS: [&str; 3] = ["%d-%m-%Y", "%d/%m/%Y", "%Y-%m-%d"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaMeasure {
    pub value: f64,
    pub unit: AreaUnit,
}

impl AreaMeasure {
    pub fn to_sqft(self) -> f64 {
        self.value * self.unit.sqft_factor()
    }
}

fn strip_currency(text: &str) -> String {
    text.replace('₹', "")
        .replace("Rs.", "")
        .replace("Rs", "")
        .replace("INR", "")
        .replace(',', "")
}

fn first_number(text: &str) -> Option<f64> {
    NUMBER
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Parses asking prices such as `₹50 Lakh`, `1.2 Cr` or `50,00,000` into rupees.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let cleaned = strip_currency(text);
    let multiplier = if CRORE.is_match(&cleaned) {
        10_000_000.0
    } else if LAKH.is_match(&cleaned) {
        100_000.0
    } else {
        1.0
    };
    first_number(&cleaned)
        .map(|v| v * multiplier)
        .filter(|v| *v > 0.0)
}

/// Parses a rate cell such as `₹15,000/sqft` into its bare number.
pub fn parse_rate_text(text: &str) -> Option<f64> {
    first_number(&strip_currency(text))
}

/// Finds the first `<number> <unit>` pair, e.g. `1,200 sqft` or `150 sq.yd`.
pub fn parse_area_text(text: &str) -> Option<AreaMeasure> {
    let caps = AREA.captures(text)?;
    let value = caps.get(1)?.as_str().replace(',', "").parse::<f64>().ok()?;
    let unit_text = caps.get(2)?.as_str().to_ascii_lowercase();
    let unit = if unit_text.contains('f') {
        AreaUnit::Sqft
    } else if unit_text.contains('y') {
        AreaUnit::Sqyd
    } else {
        AreaUnit::Sqm
    };
    Some(AreaMeasure { value, unit })
}

/// Accepts `DD-MM-YYYY`, `DD/MM/YYYY` and `YYYY-MM-DD`; a lone `20xx` year maps to January 1st.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    let year = YEAR.captures(trimmed)?.get(1)?.as_str().parse::<i32>().ok()?;
    NaiveDate::from_ymd_opt(year, 1, 1)
}

/// Capitalizes the first letter of every alphabetic run, lower-casing the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut at_boundary = true;
    for ch in input.trim().chars() {
        if ch.is_alphabetic() {
            if at_boundary {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_boundary = false;
        } else {
            out.push(ch);
            at_boundary = true;
        }
    }
    out
}

pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
