//! Next-page discovery.
//!
//! Each site has an ordered chain of strategies; the first one that yields a
//! usable URL wins. Running out of strategies is the normal end of a listing.

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use std::sync::LazyLock;

use crate::extractor::{element_text, probe_path};
use crate::model::Site;
use crate::patterns::{
    self, SitePatterns, MAX_NEXT_TEXT_CHARS, NEXT_EXCLUDED_PREFIXES, NEXT_TOKENS,
};
use crate::utils::absolute_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStrategy {
    RelNext,
    NextText,
    NextClass,
    NumericPager,
    StaticPosition,
    IndexedScan,
}

impl NextStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextStrategy::RelNext => "rel_next",
            NextStrategy::NextText => "next_text",
            NextStrategy::NextClass => "next_class",
            NextStrategy::NumericPager => "numeric_pager",
            NextStrategy::StaticPosition => "static_position",
            NextStrategy::IndexedScan => "indexed_scan",
        }
    }
}

pub const GOO_CHAIN: &[NextStrategy] = &[
    NextStrategy::RelNext,
    NextStrategy::NextText,
    NextStrategy::NextClass,
    NextStrategy::NumericPager,
    NextStrategy::StaticPosition,
];

pub const CARSENSOR_CHAIN: &[NextStrategy] = &[
    NextStrategy::RelNext,
    NextStrategy::StaticPosition,
    NextStrategy::IndexedScan,
];

static REL_NEXT_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"a[rel~="next"][href], link[rel~="next"][href]"#).expect("rel next selector")
});
static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));
static NEXT_CLASS_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href][class*="next"]"#).expect("next class selector"));
static ACTIVE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[class*="active"], [class*="current"]"#).expect("active selector")
});
static INDEX_HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/usedcar/(?:[a-z0-9_-]+/)?index(\d+)\.html").expect("index href pattern")
});
static CURRENT_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"index(\d+)\.html").expect("current index pattern"));

pub fn chain_for(site: Site) -> &'static [NextStrategy] {
    match site {
        Site::Goo => GOO_CHAIN,
        Site::CarSensor => CARSENSOR_CHAIN,
    }
}

/// Absolute URL of the next listing page, or `None` at the end of the listing.
pub fn next_page_url(site: Site, html: &str, current_url: &str) -> Option<String> {
    next_page_with_strategy(site, html, current_url).map(|(url, _)| url)
}

pub fn next_page_with_strategy(
    site: Site,
    html: &str,
    current_url: &str,
) -> Option<(String, NextStrategy)> {
    let document = Html::parse_document(html);
    let patterns = patterns::for_site(site);

    for strategy in chain_for(site) {
        let Some(href) = find_href(*strategy, &document, patterns, current_url) else {
            continue;
        };
        let url = absolute_url(current_url, &href).or_else(|| absolute_url(site.origin(), &href));
        if let Some(url) = url {
            log::debug!("[{}] next page via {}: {}", site, strategy.as_str(), url);
            return Some((url, *strategy));
        }
    }

    log::debug!("[{}] no next page after {}", site, current_url);
    None
}

fn find_href(
    strategy: NextStrategy,
    document: &Html,
    patterns: &SitePatterns,
    current_url: &str,
) -> Option<String> {
    match strategy {
        NextStrategy::RelNext => document
            .select(&REL_NEXT_SELECTOR)
            .find_map(|el| el.value().attr("href"))
            .map(str::to_string),
        NextStrategy::NextText => document
            .select(&ANCHOR_SELECTOR)
            .find(|a| is_next_text(&element_text(*a)))
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string),
        NextStrategy::NextClass => document
            .select(&NEXT_CLASS_SELECTOR)
            .find_map(|a| a.value().attr("href"))
            .map(str::to_string),
        NextStrategy::NumericPager => numeric_pager(document),
        NextStrategy::StaticPosition => static_position(document, patterns),
        NextStrategy::IndexedScan => indexed_scan(document, current_url),
    }
}

/// Short anchor text starting with a "next" token once leading arrows are
/// dropped, so `目次` and `次回` never qualify.
fn is_next_text(text: &str) -> bool {
    if text.chars().count() > MAX_NEXT_TEXT_CHARS {
        return false;
    }
    let text = text.trim_start_matches(|c: char| !c.is_alphanumeric());
    NEXT_TOKENS.iter().any(|token| text.starts_with(token))
        && !NEXT_EXCLUDED_PREFIXES
            .iter()
            .any(|prefix| text.starts_with(prefix))
}

fn numeric_pager(document: &Html) -> Option<String> {
    let current: u32 = document
        .select(&ACTIVE_SELECTOR)
        .map(element_text)
        .find(|text| !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()))?
        .parse()
        .ok()?;
    let target = current.checked_add(1)?.to_string();

    document
        .select(&ANCHOR_SELECTOR)
        .find(|a| element_text(*a) == target)
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

fn static_position(document: &Html, patterns: &SitePatterns) -> Option<String> {
    for position in patterns.static_next {
        let Ok(root_selector) = Selector::parse(&format!(r#"[id="{}"]"#, position.root_id)) else {
            continue;
        };
        let Some(root) = document.select(&root_selector).next() else {
            continue;
        };
        let Ok(element) = probe_path(root, position.path) else {
            continue;
        };

        let embedded = position.embedded_url.and_then(|pattern| Regex::new(pattern).ok());
        for attribute in position.attributes {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };
            let href = match &embedded {
                Some(re) => re.find(value).map(|m| m.as_str()),
                None => Some(value.trim()),
            };
            if let Some(href) = href.filter(|h| !h.is_empty()) {
                return Some(href.to_string());
            }
        }
    }
    None
}

fn indexed_scan(document: &Html, current_url: &str) -> Option<String> {
    let current: u32 = CURRENT_INDEX_RE
        .captures(current_url)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(1);

    document
        .select(&ANCHOR_SELECTOR)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let index: u32 = INDEX_HREF_RE.captures(href)?[1].parse().ok()?;
            (index > current).then(|| (index, href))
        })
        // min_by_key keeps the first of equal indexes
        .min_by_key(|(index, _)| *index)
        .map(|(_, href)| href.to_string())
}
