//! Selector-driven extractors for portal listing pages and government rate tables.

use plotpulse_core::{parse_rate_text, RawCircleRate, RawNumber, RawPortalListing, RawRecord};
use plotpulse_storage::OutboundRequest;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    AdapterError, CollectionTarget, Crawlability, FetchedPage, ParsedPage, RequestSide,
    SourceAdapter,
};

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn parse_selectors(selectors: &[String]) -> Result<Vec<Selector>, AdapterError> {
    selectors.iter().map(|s| parse_selector(s)).collect()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

/// First non-empty text found by trying each selector in order.
fn select_first_text(scope: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .find_map(|sel| scope.select(sel).find_map(element_text))
}

fn select_first_attr(scope: ElementRef<'_>, selectors: &[Selector], attr: &str) -> Option<String> {
    selectors.iter().find_map(|sel| {
        scope
            .select(sel)
            .find_map(|n| n.value().attr(attr).and_then(|v| text_or_none(v.to_string())))
    })
}

fn default_link_attr() -> String {
    "href".to_string()
}

fn default_disabled_class() -> String {
    "disabled".to_string()
}

/// Selectors for a portal search results page. Every field takes a fallback list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlListingConfig {
    pub card: Vec<String>,
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub area: Vec<String>,
    pub location: Vec<String>,
    pub link: Vec<String>,
    pub link_attr: String,
    pub next_page: Vec<String>,
    /// Class on the next-page control marking the last page.
    pub disabled_class: String,
    /// Fixed property type; otherwise the target's.
    pub property_type: Option<String>,
}

impl Default for HtmlListingConfig {
    fn default() -> Self {
        Self {
            card: Vec::new(),
            title: Vec::new(),
            price: Vec::new(),
            area: Vec::new(),
            location: Vec::new(),
            link: vec!["a[href]".to_string()],
            link_attr: default_link_attr(),
            next_page: Vec::new(),
            disabled_class: default_disabled_class(),
            property_type: None,
        }
    }
}

#[derive(Debug)]
struct ListingSelectors {
    card: Vec<Selector>,
    title: Vec<Selector>,
    price: Vec<Selector>,
    area: Vec<Selector>,
    location: Vec<Selector>,
    link: Vec<Selector>,
    next_page: Vec<Selector>,
}

#[derive(Debug)]
pub struct HtmlListingAdapter {
    side: RequestSide,
    config: HtmlListingConfig,
    selectors: ListingSelectors,
}

impl HtmlListingAdapter {
    pub(crate) fn new(side: RequestSide, config: &HtmlListingConfig) -> Result<Self, AdapterError> {
        let selectors = ListingSelectors {
            card: parse_selectors(&config.card)?,
            title: parse_selectors(&config.title)?,
            price: parse_selectors(&config.price)?,
            area: parse_selectors(&config.area)?,
            location: parse_selectors(&config.location)?,
            link: parse_selectors(&config.link)?,
            next_page: parse_selectors(&config.next_page)?,
        };
        Ok(Self {
            side,
            config: config.clone(),
            selectors,
        })
    }

    fn resolve_link(&self, page_url: &str, href: &str) -> Option<String> {
        let base = Url::parse(page_url)
            .or_else(|_| Url::parse(&self.side.base_url))
            .ok()?;
        base.join(href).ok().map(String::from)
    }

    fn parse_card(
        &self,
        card: ElementRef<'_>,
        target: &CollectionTarget,
        page_url: &str,
    ) -> Option<RawPortalListing> {
        let title = select_first_text(card, &self.selectors.title);
        let price_text = select_first_text(card, &self.selectors.price);
        if title.is_none() && price_text.is_none() {
            return None;
        }
        let listing_url = select_first_attr(card, &self.selectors.link, &self.config.link_attr)
            .and_then(|href| self.resolve_link(page_url, &href));

        Some(RawPortalListing {
            title,
            price_text,
            area_text: select_first_text(card, &self.selectors.area),
            area_sqft: None,
            location_text: select_first_text(card, &self.selectors.location),
            city: Some(target.name.clone()),
            district: None,
            state: target.state.clone(),
            listing_url,
            property_type: self
                .config
                .property_type
                .clone()
                .or_else(|| target.property_type.clone()),
        })
    }

    fn has_next_page(&self, document: &Html) -> bool {
        let root = document.root_element();
        self.selectors.next_page.iter().any(|sel| {
            root.select(sel)
                .next()
                .is_some_and(|next| !next.value().classes().any(|c| c == self.config.disabled_class))
        })
    }
}

impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.side.source_id
    }

    fn crawlability(&self) -> Crawlability {
        self.side.crawlability
    }

    fn build_request(
        &self,
        target: &CollectionTarget,
        page: u32,
    ) -> Result<OutboundRequest, AdapterError> {
        self.side.build(target, page)
    }

    fn parse_page(
        &self,
        target: &CollectionTarget,
        page: &FetchedPage,
    ) -> Result<ParsedPage, AdapterError> {
        let lowered = page.url.to_lowercase();
        if lowered.contains("404") || lowered.contains("error") {
            debug!(url = %page.url, "redirected to an error page");
            return Ok(ParsedPage::default());
        }

        let document = Html::parse_document(&page.text());
        let root = document.root_element();
        let cards: Vec<ElementRef<'_>> = self
            .selectors
            .card
            .iter()
            .map(|sel| root.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();

        let mut parsed = ParsedPage::default();
        for card in cards {
            match self.parse_card(card, target, &page.url) {
                Some(listing) => parsed.records.push(RawRecord::PortalListing(listing)),
                None => parsed.skipped += 1,
            }
        }
        parsed.has_more = !parsed.records.is_empty() && self.has_next_page(&document);
        Ok(parsed)
    }
}

/// Zero-based column positions in a rate table row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateColumns {
    pub taluka: Option<usize>,
    pub village: Option<usize>,
    pub zone: Option<usize>,
    pub property_type: Option<usize>,
    pub rate_per_sqft: Option<usize>,
    pub rate_per_sqm: Option<usize>,
    pub rate_per_sqyd: Option<usize>,
    pub effective_date: Option<usize>,
}

impl RateColumns {
    fn rate_columns(&self) -> impl Iterator<Item = usize> + '_ {
        [self.rate_per_sqft, self.rate_per_sqm, self.rate_per_sqyd]
            .into_iter()
            .flatten()
    }
}

fn default_table() -> String {
    "table".to_string()
}

fn default_row() -> String {
    "tr".to_string()
}

fn default_cell() -> String {
    "td".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTableConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_row")]
    pub row: String,
    #[serde(default = "default_cell")]
    pub cell: String,
    /// Leading rows dropped before parsing, e.g. a header row built from `td`.
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default)]
    pub min_cells: usize,
    pub columns: RateColumns,
    /// Fixed state name; otherwise the target's.
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug)]
pub struct HtmlRateTableAdapter {
    side: RequestSide,
    config: RateTableConfig,
    table: Selector,
    row: Selector,
    cell: Selector,
}

impl HtmlRateTableAdapter {
    pub(crate) fn new(side: RequestSide, config: &RateTableConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            side,
            table: parse_selector(&config.table)?,
            row: parse_selector(&config.row)?,
            cell: parse_selector(&config.cell)?,
            config: config.clone(),
        })
    }

    fn parse_row(
        &self,
        cells: &[String],
        target: &CollectionTarget,
        page_url: &str,
    ) -> Option<RawCircleRate> {
        let columns = &self.config.columns;
        let cell = |index: Option<usize>| {
            index
                .and_then(|i| cells.get(i))
                .filter(|v| !v.is_empty())
                .cloned()
        };
        let rate = |index: Option<usize>| cell(index).map(RawNumber::Text);

        // a row needs at least one rate column that reads as a number
        let has_rate = columns
            .rate_columns()
            .filter_map(|i| cells.get(i))
            .any(|text| parse_rate_text(text).is_some());
        if !has_rate {
            return None;
        }

        Some(RawCircleRate {
            state: self.config.state.clone().or_else(|| target.state.clone()),
            district: Some(target.name.clone()),
            taluka: cell(columns.taluka),
            village: cell(columns.village),
            zone: cell(columns.zone),
            property_type: cell(columns.property_type),
            rate_per_sqft: rate(columns.rate_per_sqft),
            rate_per_sqm: rate(columns.rate_per_sqm),
            rate_per_sqyd: rate(columns.rate_per_sqyd),
            effective_date: cell(columns.effective_date),
            source_url: Some(page_url.to_string()),
        })
    }
}

impl SourceAdapter for HtmlRateTableAdapter {
    fn source_id(&self) -> &str {
        &self.side.source_id
    }

    fn crawlability(&self) -> Crawlability {
        self.side.crawlability
    }

    fn build_request(
        &self,
        target: &CollectionTarget,
        page: u32,
    ) -> Result<OutboundRequest, AdapterError> {
        self.side.build(target, page)
    }

    fn parse_page(
        &self,
        target: &CollectionTarget,
        page: &FetchedPage,
    ) -> Result<ParsedPage, AdapterError> {
        let document = Html::parse_document(&page.text());
        let mut parsed = ParsedPage::default();
        let Some(table) = document.select(&self.table).next() else {
            debug!(url = %page.url, selector = %self.config.table, "rate table not found");
            return Ok(parsed);
        };

        for row in table.select(&self.row).skip(self.config.skip_rows) {
            let cells: Vec<String> = row
                .select(&self.cell)
                .map(|c| element_text(c).unwrap_or_default())
                .collect();
            if cells.is_empty() {
                continue;
            }
            if cells.len() < self.config.min_cells {
                parsed.skipped += 1;
                continue;
            }
            match self.parse_row(&cells, target, &page.url) {
                Some(rate) => parsed.records.push(RawRecord::CircleRate(rate)),
                None => parsed.skipped += 1,
            }
        }
        Ok(parsed)
    }
}
