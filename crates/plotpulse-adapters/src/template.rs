use std::collections::BTreeMap;

use plotpulse_storage::{Method, OutboundRequest};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{AdapterError, CollectionTarget};

fn default_method() -> String {
    "GET".to_string()
}

fn default_page_size() -> u32 {
    30
}

/// Request shape for one source, with `{placeholder}` slots filled per target and page.
///
/// Recognized placeholders: `base_url`, `name`, `slug`, `state`, `city_code`,
/// `property_type`, `property_type_code`, `page` and `offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    /// Used instead of `url` for page 1 when a site omits the page parameter there.
    #[serde(default)]
    pub first_page_url: Option<String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub form: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Items per page, used to compute `{offset}`.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl RequestTemplate {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            first_page_url: None,
            query: BTreeMap::new(),
            form: BTreeMap::new(),
            headers: BTreeMap::new(),
            page_size: default_page_size(),
        }
    }

    pub fn render(
        &self,
        base_url: &str,
        target: &CollectionTarget,
        page: u32,
    ) -> Result<OutboundRequest, AdapterError> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| AdapterError::InvalidMethod(self.method.clone()))?;

        let url_template = match (&self.first_page_url, page) {
            (Some(first), 1) => first.as_str(),
            _ => self.url.as_str(),
        };
        let url = render_placeholders(url_template, |name| {
            let value = placeholder_value(name, base_url, target, page, self.page_size)?;
            Ok(if name == "base_url" {
                value
            } else {
                urlencoding::encode(&value).into_owned()
            })
        })?;
        Url::parse(&url).map_err(|e| AdapterError::InvalidUrl {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let fill = |map: &BTreeMap<String, String>| -> Result<Vec<(String, String)>, AdapterError> {
            map.iter()
                .map(|(key, value)| {
                    let rendered = render_placeholders(value, |name| {
                        placeholder_value(name, base_url, target, page, self.page_size)
                    })?;
                    Ok((key.clone(), rendered))
                })
                .collect()
        };

        let mut request = OutboundRequest::new(method, url);
        request.query = fill(&self.query)?;
        request.form = fill(&self.form)?;
        request.headers = fill(&self.headers)?;
        Ok(request)
    }
}

fn placeholder_value(
    name: &str,
    base_url: &str,
    target: &CollectionTarget,
    page: u32,
    page_size: u32,
) -> Result<String, AdapterError> {
    let required = |value: &Option<String>| {
        value
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AdapterError::MissingPlaceholder(name.to_string()))
    };
    match name {
        "base_url" => Ok(base_url.to_string()),
        "name" => Ok(target.name.clone()),
        "slug" => Ok(target.slug()),
        "state" => required(&target.state),
        "city_code" => required(&target.city_code),
        "property_type" => required(&target.property_type),
        "property_type_code" => required(&target.property_type_code),
        "page" => Ok(page.to_string()),
        "offset" => Ok((page.saturating_sub(1) * page_size).to_string()),
        other => Err(AdapterError::UnknownPlaceholder(other.to_string())),
    }
}

/// Replaces every `{name}` in `template` with `lookup(name)`.
pub fn render_placeholders<F>(template: &str, mut lookup: F) -> Result<String, AdapterError>
where
    F: FnMut(&str) -> Result<String, AdapterError>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        out.push_str(&lookup(&after[..close])?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn district(name: &str) -> CollectionTarget {
        CollectionTarget::new("telangana_dharani", name)
    }

    #[test]
    fn url_values_are_encoded_but_base_is_not() {
        let template = RequestTemplate::get("{base_url}/homeGuidanceValue?district={name}");
        let req = template
            .render("https://dharani.telangana.gov.in", &district("Ranga Reddy"), 1)
            .unwrap();
        assert_eq!(
            req.url,
            "https://dharani.telangana.gov.in/homeGuidanceValue?district=Ranga%20Reddy"
        );
        assert!(req.query.is_empty());
    }

    #[test]
    fn first_page_url_applies_only_to_page_one() {
        let mut template = RequestTemplate::get("{base_url}/property-for-sale/plot-in-{slug}?page={page}");
        template.first_page_url = Some("{base_url}/property-for-sale/plot-in-{slug}".into());
        let target = CollectionTarget::new("magicbricks", "New Delhi");

        let first = template.render("https://www.magicbricks.com", &target, 1).unwrap();
        assert_eq!(first.url, "https://www.magicbricks.com/property-for-sale/plot-in-new-delhi");
        let third = template.render("https://www.magicbricks.com", &target, 3).unwrap();
        assert!(third.url.ends_with("plot-in-new-delhi?page=3"));
    }

    #[test]
    fn form_and_headers_are_rendered_and_method_is_checked() {
        let mut template = RequestTemplate::get("{base_url}/search");
        template.method = "post".into();
        template.form.insert("district".into(), "{name}".into());
        template.headers.insert("Referer".into(), "{base_url}/".into());
        let req = template.render("https://igrs.example", &district("Pune"), 2).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.form, vec![("district".to_string(), "Pune".to_string())]);
        assert_eq!(req.headers, vec![("Referer".to_string(), "https://igrs.example/".to_string())]);

        template.method = "FE TCH".into();
        assert!(matches!(
            template.render("https://igrs.example", &district("Pune"), 1),
            Err(AdapterError::InvalidMethod(_))
        ));
    }

    #[test]
    fn unknown_placeholders_and_bad_urls_are_errors() {
        let unknown = RequestTemplate::get("{base_url}/{tehsil}");
        assert!(matches!(
            unknown.render("https://x.test", &district("Pune"), 1),
            Err(AdapterError::UnknownPlaceholder(name)) if name == "tehsil"
        ));

        let relative = RequestTemplate::get("circle-rates/{slug}");
        assert!(matches!(
            relative.render("", &district("Pune"), 1),
            Err(AdapterError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn unclosed_braces_pass_through() {
        let out = render_placeholders("a{b", |_| Ok(String::new())).unwrap();
        assert_eq!(out, "a{b");
    }
}
