use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A code may be written as a YAML number or string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CodeValue {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
struct CityCodeEntry {
    city: String,
    #[serde(default)]
    code: Option<CodeValue>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// One written row; codes are always quoted so leading zeros survive.
#[derive(Debug, Serialize)]
struct CityCodeRow<'a> {
    city: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
}

const TABLE_HEADER: &str = "# Magicbricks city codes (homepageAutoSuggest).\n\
# Regenerate with `plotpulse discover-city-codes`. Duplicate names keep the first entry.\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityCode {
    pub city: String,
    pub code: String,
    pub state: Option<String>,
}

/// Portal city codes keyed by display name and aliases, case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct CityCodeTable {
    cities: Vec<CityCode>,
    index: HashMap<String, usize>,
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl CityCodeTable {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let entries: Vec<CityCodeEntry> =
            serde_yaml::from_str(text).context("parsing city code table")?;
        Ok(Self::from_entries(entries))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Builds a table from discovered cities with the same first-wins rule
    /// the file loader applies.
    pub fn from_cities(cities: Vec<CityCode>) -> Self {
        let entries = cities
            .into_iter()
            .map(|c| CityCodeEntry {
                city: c.city,
                code: Some(CodeValue::Text(c.code)),
                state: c.state,
                aliases: Vec::new(),
            })
            .collect();
        Self::from_entries(entries)
    }

    /// The table in the file format `load` reads, sorted by city name.
    pub fn to_yaml_string(&self) -> Result<String> {
        let mut rows: Vec<CityCodeRow<'_>> = self
            .cities
            .iter()
            .map(|c| CityCodeRow {
                city: &c.city,
                code: &c.code,
                state: c.state.as_deref(),
            })
            .collect();
        rows.sort_by_key(|r| r.city.to_lowercase());
        let body = serde_yaml::to_string(&rows).context("serializing city code table")?;
        Ok(format!("{TABLE_HEADER}{body}"))
    }

    fn from_entries(entries: Vec<CityCodeEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            let code = match entry.code {
                Some(CodeValue::Number(n)) => n.to_string(),
                Some(CodeValue::Text(t)) if !t.trim().is_empty() => t.trim().to_string(),
                _ => {
                    warn!(city = %entry.city, "dropping city without a code");
                    continue;
                }
            };
            let name_key = key(&entry.city);
            if table.index.contains_key(&name_key) {
                warn!(city = %entry.city, "duplicate city in code table, keeping the first");
                continue;
            }

            let position = table.cities.len();
            table.index.insert(name_key, position);
            for alias in &entry.aliases {
                table.index.entry(key(alias)).or_insert(position);
            }
            table.cities.push(CityCode {
                city: entry.city.trim().to_string(),
                code,
                state: entry.state,
            });
        }
        table
    }

    pub fn lookup(&self, name: &str) -> Option<&CityCode> {
        self.index.get(&key(name)).map(|&i| &self.cities[i])
    }

    /// Cities in file order.
    pub fn cities(&self) -> &[CityCode] {
        &self.cities
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }
}
