//! Raw records to canonical listings, plus the detail-page overlay.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;

use crate::extractor::SiteExtractor;
use crate::fetch::PageFetcher;
use crate::model::{CanonicalListing, DetailFields, Field, RawFragments, RawRecord, Site};
use crate::normalize::{
    canonical_body_type, compact_text, free_text, implausible_numbers, is_suspicious,
    parse_engine_cc, parse_fuel_economy, parse_mileage, parse_price, parse_small_count,
    parse_year, split_maker_model, strip_label, to_halfwidth, transmission_code, Category,
    FieldKind, TransmissionCode,
};
use crate::patterns::{self, BODY_TYPE_LABEL, TRANSMISSION_LABEL};
use crate::utils::absolute_url;

/// Prefix of raw detail-page texts inside `raw_fragments.fields`.
const DETAIL_FRAGMENT_PREFIX: &str = "detail_";

fn maker_and_name(record: &RawRecord) -> (Option<String>, Option<String>) {
    let name = record.get(Field::Name);
    match record.get(Field::Manufacturer) {
        Some(maker) => (
            free_text(Some(maker)),
            name.map(to_halfwidth).and_then(|n| free_text(Some(n.as_str()))),
        ),
        None => name.map(split_maker_model).unwrap_or((None, None)),
    }
}

fn transmission_text(raw: Option<&str>) -> Option<String> {
    strip_label(compact_text(raw), TRANSMISSION_LABEL)
}

fn body_type_text(raw: Option<&str>) -> Option<String> {
    canonical_body_type(strip_label(compact_text(raw), BODY_TYPE_LABEL))
}

/// Builds the canonical listing for one extracted record.
pub fn assemble(site: Site, record: RawRecord) -> CanonicalListing {
    let (manufacturer, name) = maker_and_name(&record);
    let get = |field: Field| record.get(field);

    let mut listing = CanonicalListing::empty(site, record.id.clone());
    listing.manufacturer = manufacturer;
    listing.name = name;
    listing.price = parse_price(get(Field::Price));
    listing.year = parse_year(get(Field::Year));
    listing.mileage_km = parse_mileage(get(Field::Mileage));
    listing.engine_cc = parse_engine_cc(get(Field::Engine));
    listing.transmission_raw = transmission_text(get(Field::Transmission));
    listing.transmission_code = transmission_code(listing.transmission_raw.as_deref());
    listing.body_type = body_type_text(get(Field::BodyType));
    listing.color = compact_text(get(Field::Color));
    listing.accident_note = compact_text(get(Field::AccidentNote));
    listing.dealer_location = compact_text(get(Field::Location));
    listing.options_text = free_text(get(Field::Options));
    listing.drivetrain = compact_text(get(Field::Drivetrain));
    listing.seat_count = parse_small_count(get(Field::Seats));
    listing.door_count = parse_small_count(get(Field::Doors));
    listing.fuel_type = compact_text(get(Field::FuelType));
    listing.steering_side = compact_text(get(Field::Steering));
    listing.fuel_economy = parse_fuel_economy(get(Field::FuelEconomy));
    listing.detail_url = get(Field::DetailUrl).and_then(|href| absolute_url(site.origin(), href));
    listing.category = Category::from_engine_cc(listing.engine_cc);

    listing.raw_fragments = RawFragments {
        strategy: record.strategy.as_str().to_string(),
        pattern_version: patterns::for_site(site).version.to_string(),
        pattern_fields: record
            .pattern_fields
            .iter()
            .map(|field| field.as_str().to_string())
            .collect(),
        fields: record
            .fields
            .iter()
            .map(|(field, text)| (field.as_str().to_string(), text.clone()))
            .collect(),
    };
    listing.suspicious = looks_suspicious(&listing);
    listing
}

/// Decoding artifacts in any text field, or a number no listing can have.
pub fn looks_suspicious(listing: &CanonicalListing) -> bool {
    let categorical = [
        &listing.transmission_raw,
        &listing.body_type,
        &listing.color,
        &listing.fuel_type,
        &listing.drivetrain,
        &listing.steering_side,
    ];
    let free = [
        &listing.name,
        &listing.manufacturer,
        &listing.accident_note,
        &listing.dealer_location,
        &listing.options_text,
    ];

    categorical
        .iter()
        .filter_map(|value| value.as_deref())
        .any(|value| is_suspicious(value, FieldKind::Categorical))
        || free
            .iter()
            .filter_map(|value| value.as_deref())
            .any(|value| is_suspicious(value, FieldKind::FreeText))
        || implausible_numbers(
            listing.price,
            listing.year,
            listing.mileage_km,
            listing.engine_cc,
        )
}

/// Typed values read from a detail page. Absent values never clear a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailOverlay {
    pub name: Option<String>,
    pub options_text: Option<String>,
    pub drivetrain: Option<String>,
    pub seat_count: Option<u8>,
    pub door_count: Option<u8>,
    pub fuel_type: Option<String>,
    pub steering_side: Option<String>,
    pub fuel_economy: Option<f64>,
    pub transmission_raw: Option<String>,
    pub transmission_code: Option<TransmissionCode>,
    pub engine_cc: Option<u32>,
    pub year: Option<u16>,
    pub mileage_km: Option<u32>,
    pub accident_note: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    raw: BTreeMap<String, String>,
}

impl DetailOverlay {
    pub fn from_fields(fields: &DetailFields) -> Self {
        let get = |field: Field| fields.get(&field).map(String::as_str);
        let transmission_raw = transmission_text(get(Field::Transmission));

        Self {
            name: get(Field::Name).map(to_halfwidth).and_then(|n| free_text(Some(n.as_str()))),
            options_text: free_text(get(Field::Options)),
            drivetrain: compact_text(get(Field::Drivetrain)),
            seat_count: parse_small_count(get(Field::Seats)),
            door_count: parse_small_count(get(Field::Doors)),
            fuel_type: compact_text(get(Field::FuelType)),
            steering_side: compact_text(get(Field::Steering)),
            fuel_economy: parse_fuel_economy(get(Field::FuelEconomy)),
            transmission_code: transmission_code(transmission_raw.as_deref()),
            transmission_raw,
            engine_cc: parse_engine_cc(get(Field::Engine)),
            year: parse_year(get(Field::Year)),
            mileage_km: parse_mileage(get(Field::Mileage)),
            accident_note: compact_text(get(Field::AccidentNote)),
            body_type: body_type_text(get(Field::BodyType)),
            color: compact_text(get(Field::Color)),
            raw: fields
                .iter()
                .map(|(field, text)| {
                    (format!("{}{}", DETAIL_FRAGMENT_PREFIX, field.as_str()), text.clone())
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

macro_rules! overlay_fields {
    ($listing:ident, $overlay:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $overlay.$field {
                $listing.$field = Some(value);
            }
        )+
    };
}

/// Overwrites every field the overlay has a value for and nothing else.
pub fn apply_overlay(listing: &mut CanonicalListing, overlay: DetailOverlay) {
    overlay_fields!(
        listing,
        overlay,
        name,
        options_text,
        drivetrain,
        seat_count,
        door_count,
        fuel_type,
        steering_side,
        fuel_economy,
        transmission_raw,
        transmission_code,
        engine_cc,
        year,
        mileage_km,
        accident_note,
        body_type,
        color,
    );

    listing.category = Category::from_engine_cc(listing.engine_cc);
    listing.raw_fragments.fields.extend(overlay.raw);
    listing.suspicious = looks_suspicious(listing);
}

async fn enrich_one(
    fetcher: &dyn PageFetcher,
    extractor: &dyn SiteExtractor,
    mut listing: CanonicalListing,
) -> CanonicalListing {
    let Some(url) = listing.detail_url.clone() else {
        return listing;
    };

    match fetcher.fetch(&url).await {
        Ok(page) => {
            let decoded = page.decode();
            let overlay = DetailOverlay::from_fields(&extractor.parse_detail(&decoded.text));
            if overlay.is_empty() {
                log::warn!("[{}] detail page {} had no recognizable fields", listing.site, url);
            } else {
                apply_overlay(&mut listing, overlay);
            }
        }
        Err(e) => log::warn!(
            "[{}] detail fetch failed for {}: {:#}",
            listing.site,
            listing.id,
            e
        ),
    }
    listing
}

/// Fetches one detail page per listing. `parallelism` 1 is strictly sequential.
/// Output order matches input order; failures leave a listing unchanged.
pub async fn enrich_listings(
    fetcher: &dyn PageFetcher,
    extractor: &dyn SiteExtractor,
    listings: Vec<CanonicalListing>,
    parallelism: usize,
) -> Vec<CanonicalListing> {
    log::info!(
        "Enriching {} listings from detail pages (parallelism {})",
        listings.len(),
        parallelism.max(1)
    );
    stream::iter(
        listings
            .into_iter()
            .map(|listing| enrich_one(fetcher, extractor, listing)),
    )
    .buffered(parallelism.max(1))
    .collect()
    .await
}
