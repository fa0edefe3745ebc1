use plotpulse_adapters::CollectionTarget;
use serde::Serialize;
use tracing::warn;

use crate::city_codes::CityCodeTable;
use crate::registry::SourceConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTarget {
    pub source_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetPlan {
    pub targets: Vec<CollectionTarget>,
    pub skipped: Vec<SkippedTarget>,
}

/// Expands a source into targets: names (explicit, or every table city) × property types.
///
/// `limit` caps the number of names and overrides the source's own `max_targets`.
pub fn expand_targets(
    source: &SourceConfig,
    city_codes: Option<&CityCodeTable>,
    limit: Option<usize>,
) -> TargetPlan {
    let mut names: Vec<String> = if source.targets.is_empty() {
        city_codes
            .map(|table| table.cities().iter().map(|c| c.city.clone()).collect())
            .unwrap_or_default()
    } else {
        source.targets.clone()
    };
    if let Some(limit) = limit.or(source.max_targets) {
        names.truncate(limit);
    }

    let needs_code = source.requires_city_code();
    let mut plan = TargetPlan::default();
    for name in names {
        let entry = city_codes.and_then(|table| table.lookup(&name));
        if needs_code && entry.is_none() {
            warn!(source_id = %source.source_id, name = %name, "no city code, skipping target");
            plan.skipped.push(SkippedTarget {
                source_id: source.source_id.clone(),
                name,
                reason: "no city code".to_string(),
            });
            continue;
        }

        let base = CollectionTarget {
            source_id: source.source_id.clone(),
            name: name.clone(),
            state: source
                .state
                .clone()
                .or_else(|| entry.and_then(|e| e.state.clone())),
            property_type: None,
            property_type_code: None,
            city_code: entry.map(|e| e.code.clone()),
        };
        if source.property_types.is_empty() {
            plan.targets.push(base);
            continue;
        }
        for kind in &source.property_types {
            plan.targets.push(CollectionTarget {
                property_type: Some(kind.name.clone()),
                property_type_code: kind.code.clone(),
                ..base.clone()
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceRegistry;

    const REGISTRY: &str = r#"
sources:
  - source_id: magicbricks_api
    display_name: Magicbricks search API
    crawlability: api
    base_url: https://www.magicbricks.com
    request:
      url: "{base_url}/mbsrp/propertySearch.html"
      query: { city: "{city_code}", propertyType: "{property_type_code}" }
    extractor:
      kind: json_listing
    targets: [Pune, Kochi, Chennai]
    property_types:
      - { name: plot, code: "10003" }
      - { name: flat, code: "10001" }
  - source_id: magicbricks
    display_name: Magicbricks search pages
    crawlability: public_html
    base_url: https://www.magicbricks.com
    request:
      url: "{base_url}/property-for-sale/plot-in-{slug}"
    extractor:
      kind: html_listing
    targets: [Kochi]
"#;

    const TABLE: &str = r#"
- city: Pune
  code: 4378
  state: Maharashtra
- city: Madras
  code: 5196
  state: Tamil Nadu
  aliases: [Chennai]
- city: Hyderabad
  code: 2060
"#;

    fn fixtures() -> (SourceRegistry, CityCodeTable) {
        (
            SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
            CityCodeTable::from_yaml_str(TABLE).unwrap(),
        )
    }

    #[test]
    fn missing_city_codes_are_skipped_not_failed() {
        let (registry, table) = fixtures();
        let plan = expand_targets(registry.get("magicbricks_api").unwrap(), Some(&table), None);

        assert_eq!(plan.targets.len(), 4);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].name, "Kochi");

        let first = &plan.targets[0];
        assert_eq!(first.name, "Pune");
        assert_eq!(first.city_code.as_deref(), Some("4378"));
        assert_eq!(first.state.as_deref(), Some("Maharashtra"));
        assert_eq!(first.property_type.as_deref(), Some("plot"));
        assert_eq!(first.property_type_code.as_deref(), Some("10003"));

        let chennai_flat = &plan.targets[3];
        assert_eq!(chennai_flat.name, "Chennai");
        assert_eq!(chennai_flat.city_code.as_deref(), Some("5196"));
        assert_eq!(chennai_flat.property_type.as_deref(), Some("flat"));
    }

    #[test]
    fn sources_without_city_codes_keep_every_target() {
        let (registry, _) = fixtures();
        let plan = expand_targets(registry.get("magicbricks").unwrap(), None, None);
        assert_eq!(plan.targets.len(), 1);
        assert!(plan.skipped.is_empty());
        assert_eq!(plan.targets[0].property_type, None);
    }

    #[test]
    fn empty_target_list_walks_the_table_with_a_limit() {
        let (mut registry, table) = fixtures();
        registry.sources[0].targets.clear();
        let source = registry.get("magicbricks_api").unwrap();

        let plan = expand_targets(source, Some(&table), Some(2));
        let names: Vec<&str> = plan.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Pune", "Pune", "Madras", "Madras"]);

        let all = expand_targets(source, Some(&table), None);
        assert_eq!(all.targets.len(), 6);
    }
}
