use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::normalize::{Category, TransmissionCode};

/// A supported marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Goo,
    CarSensor,
}

impl Site {
    pub const ALL: [Site; 2] = [Site::Goo, Site::CarSensor];

    pub fn key(&self) -> &'static str {
        match self {
            Site::Goo => "goo",
            Site::CarSensor => "carsensor",
        }
    }

    /// Origin used to resolve relative links.
    pub fn origin(&self) -> &'static str {
        match self {
            Site::Goo => "https://www.goo-net.com",
            Site::CarSensor => "https://www.carsensor.net",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Site {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "goo" | "goonet" | "goo-net" => Ok(Site::Goo),
            "carsensor" => Ok(Site::CarSensor),
            other => bail!("Unknown site: {}", other),
        }
    }
}

/// Raw fields an extractor can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Manufacturer,
    Price,
    Year,
    Mileage,
    Engine,
    Transmission,
    BodyType,
    Color,
    AccidentNote,
    Location,
    DetailUrl,
    Options,
    Drivetrain,
    Seats,
    Doors,
    FuelType,
    Steering,
    FuelEconomy,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Manufacturer => "manufacturer",
            Field::Price => "price",
            Field::Year => "year",
            Field::Mileage => "mileage",
            Field::Engine => "engine",
            Field::Transmission => "transmission",
            Field::BodyType => "body_type",
            Field::Color => "color",
            Field::AccidentNote => "accident_note",
            Field::Location => "location",
            Field::DetailUrl => "detail_url",
            Field::Options => "options",
            Field::Drivetrain => "drivetrain",
            Field::Seats => "seats",
            Field::Doors => "doors",
            Field::FuelType => "fuel_type",
            Field::Steering => "steering",
            Field::FuelEconomy => "fuel_economy",
        }
    }
}

/// Extraction layer that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Structural,
    PatternFallback,
    AnchorDiscovery,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Structural => "structural",
            Strategy::PatternFallback => "pattern_fallback",
            Strategy::AnchorDiscovery => "anchor_discovery",
        }
    }
}

/// Label/value pairs read from a detail page.
pub type DetailFields = BTreeMap<Field, String>;

/// One container's field texts before normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub id: String,
    pub fields: BTreeMap<Field, String>,
    pub strategy: Strategy,
    /// Fields filled by the pattern scan rather than a structural probe.
    pub pattern_fields: Vec<Field>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            strategy,
            pattern_fields: Vec::new(),
        }
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// Stores a non-blank value; blank text leaves the field unset.
    pub fn set(&mut self, field: Field, value: impl AsRef<str>) {
        let value = value.as_ref().trim();
        if !value.is_empty() {
            self.fields.insert(field, value.to_string());
        }
    }
}

/// Pre-normalization provenance kept alongside a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFragments {
    pub strategy: String,
    pub pattern_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern_fields: Vec<String>,
    pub fields: BTreeMap<String, String>,
}

impl RawFragments {
    /// Deterministic JSON: struct fields in declaration order, map keys sorted.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Storage identity of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub site: Site,
    pub id: String,
}

/// One vehicle listing in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub site: Site,
    pub id: String,
    pub manufacturer: Option<String>,
    pub name: Option<String>,
    /// Man-yen (10,000 JPY) units.
    pub price: Option<u32>,
    pub year: Option<u16>,
    pub mileage_km: Option<u32>,
    pub engine_cc: Option<u32>,
    pub transmission_code: Option<TransmissionCode>,
    pub transmission_raw: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub accident_note: Option<String>,
    pub dealer_location: Option<String>,
    pub options_text: Option<String>,
    pub drivetrain: Option<String>,
    pub seat_count: Option<u8>,
    pub door_count: Option<u8>,
    pub fuel_type: Option<String>,
    pub steering_side: Option<String>,
    /// km/L.
    pub fuel_economy: Option<f64>,
    pub detail_url: Option<String>,
    pub category: Option<Category>,
    pub raw_fragments: RawFragments,
    pub suspicious: bool,
}

impl CanonicalListing {
    pub fn empty(site: Site, id: impl Into<String>) -> Self {
        Self {
            site,
            id: id.into(),
            manufacturer: None,
            name: None,
            price: None,
            year: None,
            mileage_km: None,
            engine_cc: None,
            transmission_code: None,
            transmission_raw: None,
            body_type: None,
            color: None,
            accident_note: None,
            dealer_location: None,
            options_text: None,
            drivetrain: None,
            seat_count: None,
            door_count: None,
            fuel_type: None,
            steering_side: None,
            fuel_economy: None,
            detail_url: None,
            category: None,
            raw_fragments: RawFragments::default(),
            suspicious: false,
        }
    }

    pub fn key(&self) -> ListingKey {
        ListingKey {
            site: self.site,
            id: self.id.clone(),
        }
    }
}
