//! Site-independent extraction driver.
//!
//! A page is processed in three layers: structural probes at fixed relative
//! paths inside each listing container, a value-shape scan for whatever the
//! probes missed, and, only when no container matched at all, discovery from
//! detail-page anchors. Every failure below the container id is confined to the
//! field it happened in.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use thiserror::Error;

use crate::model::{DetailFields, Field, RawRecord, Site, Strategy};
use crate::normalize::{self, compact_text, free_text, to_halfwidth};
use crate::patterns::{
    ProbeRoot, SitePatterns, ACCIDENT_TOKEN, ANCESTOR_CLIMB_LIMIT, BODY_TYPE_KEYWORDS, CARD_TAGS,
    DETAIL_LABELS, MAX_LOCATION_CHARS, MIN_LOCATION_CHARS, PREFECTURE_SUFFIXES,
    TRANSMISSION_LABEL,
};

/// Leaf texts longer than this are prose, not field values.
const MAX_TOKEN_CHARS: usize = 20;

/// Order matters: a leaf is claimed by the first field it fits.
const SCANNED_FIELDS: &[Field] = &[
    Field::Mileage,
    Field::Engine,
    Field::Price,
    Field::Year,
    Field::AccidentNote,
    Field::Transmission,
    Field::BodyType,
    Field::Location,
];

static ID_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[id]").expect("id selector"));
static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));
static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2, h3, strong, p").expect("title selector"));
static DT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("dt, th").expect("label selector"));
static DETAIL_HEADING_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("main section h1").expect("heading selector"));
static ANY_HEADING_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("h1 selector"));

/// Why a structural path did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("no element at segment '{segment}' of path '{path}'")]
    ShapeMismatch { path: String, segment: String },
    #[error("invalid path segment '{0}'")]
    InvalidSegment(String),
    #[error("element at '{0}' has no text")]
    Empty(String),
}

/// Regexes and selectors of one site's pattern table, compiled once.
pub struct CompiledPatterns {
    pub patterns: &'static SitePatterns,
    container: Selector,
    container_id: Regex,
    detail_anchor: Regex,
}

impl CompiledPatterns {
    pub fn new(patterns: &'static SitePatterns) -> Result<Self> {
        let container = Selector::parse(patterns.container_selector)
            .map_err(|e| anyhow!("Failed to parse container selector: {:?}", e))?;
        let container_id = Regex::new(patterns.container_id_pattern)
            .context("Failed to compile container id pattern")?;
        let detail_anchor = Regex::new(patterns.detail_anchor_pattern)
            .context("Failed to compile detail anchor pattern")?;

        Ok(Self {
            patterns,
            container,
            container_id,
            detail_anchor,
        })
    }

    pub fn container_id(&self, raw_id: &str) -> Option<String> {
        self.container_id
            .captures(raw_id)
            .and_then(|caps| caps.get(1))
            .and_then(|m| compact_text(Some(m.as_str())))
    }

    pub fn detail_anchor_id(&self, href: &str) -> Option<String> {
        self.detail_anchor
            .captures(href)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Per-page lookups shared by every container of the page.
pub struct PageContext<'a> {
    pub document: &'a Html,
    ids: HashMap<&'a str, ElementRef<'a>>,
}

impl<'a> PageContext<'a> {
    pub fn new(document: &'a Html) -> Self {
        let mut ids = HashMap::new();
        for element in document.select(&ID_SELECTOR) {
            if let Some(id) = element.value().id() {
                ids.entry(id).or_insert(element);
            }
        }
        Self { document, ids }
    }

    pub fn by_id(&self, id: &str) -> Option<ElementRef<'a>> {
        self.ids.get(id).copied()
    }
}

/// Site-specific knowledge plugged into the shared driver.
pub trait SiteExtractor: Send + Sync {
    fn compiled(&self) -> &CompiledPatterns;

    fn site(&self) -> Site {
        self.compiled().patterns.site
    }

    /// Fields the pattern table cannot express, read after the table probes.
    fn extract_site_fields(
        &self,
        page: &PageContext<'_>,
        container: ElementRef<'_>,
        card: ElementRef<'_>,
        record: &mut RawRecord,
    );

    fn parse_detail(&self, html: &str) -> DetailFields {
        parse_detail_fields(html)
    }
}

/// Result of extracting one listing page.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PageExtraction {
    pub records: Vec<RawRecord>,
    pub containers_found: usize,
    /// Containers whose listing id could not be determined.
    pub dropped: usize,
}

pub fn extractor_for(site: Site) -> Result<Box<dyn SiteExtractor>> {
    Ok(match site {
        Site::Goo => Box::new(crate::goonet::GooExtractor::new()?),
        Site::CarSensor => Box::new(crate::carsensor::CarSensorExtractor::new()?),
    })
}

pub fn extract_page(extractor: &dyn SiteExtractor, html: &str) -> PageExtraction {
    let document = Html::parse_document(html);
    let page = PageContext::new(&document);
    let compiled = extractor.compiled();
    let mut extraction = PageExtraction::default();
    let mut seen = HashSet::new();

    for container in document.select(&compiled.container) {
        extraction.containers_found += 1;

        let raw_id = container.value().id().unwrap_or_default();
        let Some(id) = compiled.container_id(raw_id) else {
            log::warn!(
                "[{}] dropping container without a listing id (id attribute '{}')",
                extractor.site(),
                raw_id
            );
            extraction.dropped += 1;
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let record = extract_container(extractor, &page, container, id);
        extraction.records.push(record);
    }

    if extraction.containers_found == 0 {
        log::warn!(
            "[{}] no listing containers matched '{}'; the page markup may have changed, trying detail anchors",
            extractor.site(),
            compiled.patterns.container_selector
        );
        discover_from_anchors(compiled, &document, &mut seen, &mut extraction.records);
    }

    log::debug!(
        "[{}] extracted {} records from {} containers ({} dropped)",
        extractor.site(),
        extraction.records.len(),
        extraction.containers_found,
        extraction.dropped
    );
    extraction
}

fn extract_container(
    extractor: &dyn SiteExtractor,
    page: &PageContext<'_>,
    container: ElementRef<'_>,
    id: String,
) -> RawRecord {
    let patterns = extractor.compiled().patterns;
    let card = patterns
        .card_path
        .and_then(|path| probe_path(container, path).ok())
        .unwrap_or(container);

    let mut record = RawRecord::new(id, Strategy::Structural);

    for probe in patterns.field_probes {
        let root = match probe.root {
            ProbeRoot::Container => container,
            ProbeRoot::Card => card,
        };
        for path in probe.paths {
            match probe_text(root, path) {
                Ok(text) => {
                    record.set(probe.field, text);
                    break;
                }
                Err(e) => log::debug!("[{}] {} probe: {}", record.id, probe.field.as_str(), e),
            }
        }
    }

    if let Some(lines) = patterns
        .remarks_paths
        .iter()
        .find_map(|path| probe_path(card, path).ok())
        .map(text_lines)
    {
        for (field, line) in [Field::Color, Field::Transmission, Field::BodyType]
            .into_iter()
            .zip(lines)
        {
            if record.get(field).is_none() {
                record.set(field, line);
            }
        }
    }

    extractor.extract_site_fields(page, container, card, &mut record);

    let filled = pattern_scan(container, &mut record);
    if !filled.is_empty() {
        log::debug!(
            "[{}] pattern fallback filled {:?}",
            record.id,
            filled.iter().map(Field::as_str).collect::<Vec<_>>()
        );
        record.strategy = Strategy::PatternFallback;
        record.pattern_fields = filled;
    }

    record
}

fn discover_from_anchors(
    compiled: &CompiledPatterns,
    document: &Html,
    seen: &mut HashSet<String>,
    records: &mut Vec<RawRecord>,
) {
    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(id) = compiled.detail_anchor_id(href) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let card = climb_to_card(anchor);
        let mut record = RawRecord::new(id, Strategy::AnchorDiscovery);
        record.set(Field::DetailUrl, href);

        if let Some(title) = card
            .select(&TITLE_SELECTOR)
            .map(element_text)
            .find(|text| (2..=120).contains(&text.chars().count()))
        {
            record.set(Field::Name, title);
        }

        record.pattern_fields = pattern_scan(card, &mut record);
        records.push(record);
    }
}

/// Walks `path` (`div[2]/div/ul/li[1]`, 1-based per tag) over element children.
pub fn probe_path<'a>(root: ElementRef<'a>, path: &str) -> Result<ElementRef<'a>, ProbeError> {
    let mut node = root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let (tag, nth) = parse_segment(segment)?;
        node = element_children(node)
            .filter(|child| child.value().name() == tag)
            .nth(nth - 1)
            .ok_or_else(|| ProbeError::ShapeMismatch {
                path: path.to_string(),
                segment: segment.to_string(),
            })?;
    }
    Ok(node)
}

/// Trimmed text at `path`; empty text is an error so the next path is tried.
pub fn probe_text(root: ElementRef<'_>, path: &str) -> Result<String, ProbeError> {
    let text = element_text(probe_path(root, path)?);
    if text.is_empty() {
        return Err(ProbeError::Empty(path.to_string()));
    }
    Ok(text)
}

fn parse_segment(segment: &str) -> Result<(&str, usize), ProbeError> {
    let Some((tag, rest)) = segment.split_once('[') else {
        return Ok((segment, 1));
    };
    let nth = rest
        .strip_suffix(']')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n >= 1)
        .ok_or_else(|| ProbeError::InvalidSegment(segment.to_string()))?;
    Ok((tag, nth))
}

pub fn element_children<'a>(element: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    element.children().filter_map(ElementRef::wrap)
}

/// All descendant text, trimmed.
pub fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Text nodes split into lines with all spacing removed; blank lines dropped.
pub fn text_lines(element: ElementRef<'_>) -> Vec<String> {
    element
        .text()
        .flat_map(|text| text.split(['\n', '\r']))
        .filter_map(|line| compact_text(Some(line)))
        .collect()
}

/// Climbs from a detail anchor to the element that approximates its card.
pub fn climb_to_card(anchor: ElementRef<'_>) -> ElementRef<'_> {
    let mut node = anchor;
    for _ in 0..ANCESTOR_CLIMB_LIMIT {
        let Some(parent) = node.parent().and_then(ElementRef::wrap) else {
            break;
        };
        node = parent;
        if CARD_TAGS.contains(&node.value().name()) && element_children(node).count() >= 2 {
            break;
        }
    }
    node
}

fn leaf_elements<'a>(root: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    root.descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| !matches!(el.value().name(), "script" | "style"))
        .filter(|el| el.children().all(|child| !child.value().is_element()))
}

/// True for `"岡山県岡山市南区"`-like texts.
pub fn looks_like_location(text: &str) -> bool {
    let len = text.chars().count();
    (MIN_LOCATION_CHARS..=MAX_LOCATION_CHARS).contains(&len)
        && text.contains(PREFECTURE_SUFFIXES)
        && !text.contains('万')
}

fn fits(field: Field, text: &str) -> bool {
    let short = text.chars().count() <= MAX_TOKEN_CHARS;
    match field {
        Field::Mileage => {
            short
                && !text.contains("/L")
                && !text.contains("km/")
                && normalize::parse_mileage(Some(text)).is_some()
        }
        Field::Engine => short && normalize::parse_engine_cc(Some(text)).is_some(),
        // `3.2万km` is a distance, never a price
        Field::Price => {
            short
                && text.contains('万')
                && normalize::parse_mileage(Some(text)).is_none()
                && normalize::parse_price(Some(text)).is_some()
        }
        Field::Year => short && normalize::parse_year(Some(text)).is_some(),
        Field::AccidentNote => short && text.contains(ACCIDENT_TOKEN),
        Field::Transmission => {
            short
                && (normalize::transmission_code(Some(text)).is_some()
                    || text.contains(TRANSMISSION_LABEL))
        }
        Field::BodyType => short && BODY_TYPE_KEYWORDS.iter().any(|k| text.contains(k)),
        Field::Location => looks_like_location(text),
        _ => false,
    }
}

/// Fills fields the structural layer left empty from value-shaped leaf texts.
/// Returns the fields it filled.
pub fn pattern_scan(root: ElementRef<'_>, record: &mut RawRecord) -> Vec<Field> {
    let mut filled = Vec::new();
    let missing: Vec<Field> = SCANNED_FIELDS
        .iter()
        .copied()
        .filter(|field| record.get(*field).is_none())
        .collect();
    if missing.is_empty() {
        return filled;
    }

    let mut bare_price = None;
    for leaf in leaf_elements(root) {
        let text = element_text(leaf);
        if text.is_empty() {
            continue;
        }
        let halfwidth = to_halfwidth(&text);

        if bare_price.is_none()
            && matches!(leaf.value().name(), "p" | "span" | "em")
            && halfwidth.chars().all(|c| c.is_ascii_digit() || c == '.')
            && normalize::parse_price(Some(halfwidth.as_str())).is_some()
        {
            bare_price = Some(text.clone());
        }

        let claimed = missing
            .iter()
            .copied()
            .filter(|field| !filled.contains(field))
            .find(|field| fits(*field, &halfwidth));
        if let Some(field) = claimed {
            record.set(field, &text);
            filled.push(field);
        }
    }

    if missing.contains(&Field::Price) && !filled.contains(&Field::Price) {
        if let Some(price) = bare_price {
            record.set(Field::Price, price);
            filled.push(Field::Price);
        }
    }

    filled.sort();
    filled
}

/// Reads label/value pairs and the title heading from a detail page.
pub fn parse_detail_fields(html: &str) -> DetailFields {
    let document = Html::parse_document(html);
    let mut fields = DetailFields::new();

    let heading = document
        .select(&DETAIL_HEADING_SELECTOR)
        .next()
        .or_else(|| document.select(&ANY_HEADING_SELECTOR).next());
    if let Some(heading) = heading {
        let own_text: String = heading
            .children()
            .filter_map(|child| child.value().as_text().map(|t| t.to_string()))
            .collect();
        if let Some(name) = free_text(Some(own_text.as_str())) {
            fields.insert(Field::Name, name);
        }
        if let Some(option) = element_children(heading)
            .find(|child| child.value().name() == "span")
            .map(element_text)
            .and_then(|text| free_text(Some(text.as_str())))
        {
            fields.insert(Field::Options, option);
        }
    }

    for label in document.select(&DT_SELECTOR) {
        let Some(label_text) = compact_text(Some(element_text(label).as_str())) else {
            continue;
        };
        let Some(field) = DETAIL_LABELS
            .iter()
            .find(|(name, _)| label_text.contains(name))
            .map(|(_, field)| *field)
        else {
            continue;
        };
        let value = label
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .next()
            .filter(|sibling| matches!(sibling.value().name(), "dd" | "td"))
            .map(element_text)
            .and_then(|text| free_text(Some(text.as_str())));
        if let Some(value) = value {
            fields.entry(field).or_insert(value);
        }
    }

    fields
}
