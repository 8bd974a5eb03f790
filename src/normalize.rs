//! Field normalization: raw listing text to typed values.
//!
//! Every function here is total. Unparseable input yields `None`, never a panic
//! and never a guessed default. Numeric parsers map full-width characters to
//! half-width before they look at the text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Engine displacement at or below which a vehicle is a kei car.
pub const KEI_MAX_CC: u32 = 660;

/// Categorical values longer than this are treated as extraction noise.
pub const MAX_CATEGORICAL_CHARS: usize = 40;

/// A calendar era usable in abbreviated model years (`R3`, `平成22`).
#[derive(Debug, Clone, Copy)]
pub struct Era {
    pub markers: &'static [&'static str],
    /// Gregorian year of era year 0, so era year 1 is `offset + 1`.
    pub offset: u16,
}

/// Supported eras. Adding an era is a data change only.
pub const ERAS: &[Era] = &[
    Era {
        markers: &["令和", "R", "r"],
        offset: 2018,
    },
    Era {
        markers: &["平成", "H", "h"],
        offset: 1988,
    },
];

/// Canonical names for body type spellings that differ between sites.
const BODY_TYPE_ALIASES: &[(&str, &str)] = &[
    ("ミニバン・ワンボックス", "ミニバン"),
    ("SUV・クロスカントリー", "SUV"),
];

static PRICE_MAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*万").expect("price pattern"));
static BARE_DECIMAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)$").expect("decimal pattern"));
static MILEAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9]+(?:\.[0-9]+)?)\s*(万)?\s*km").expect("mileage pattern")
});
static YEAR_WESTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])((?:19|20)[0-9]{2})(?:[^0-9]|$)").expect("year pattern")
});
static YEAR_ERA_RE: LazyLock<Regex> = LazyLock::new(|| {
    let mut markers: Vec<&str> = ERAS.iter().flat_map(|era| era.markers.iter().copied()).collect();
    markers.sort_by_key(|m| std::cmp::Reverse(m.len()));
    let alternation = markers
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"({alternation})\s*(元|[0-9]{{1,2}})")).expect("era pattern")
});
static ENGINE_CC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([0-9]+)\s*cc").expect("cc pattern"));
static ENGINE_LITER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*[lL]").expect("liter pattern"));
static SMALL_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^0-9])([0-9]{1,2})(?:[^0-9]|$)").expect("count pattern"));
static FUEL_ECONOMY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9]+(?:\.[0-9]+)?)\s*km").expect("fuel economy pattern")
});
static TRANSMISSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^A-Z])(AT|MT)(?:[^A-Z]|$)").expect("transmission pattern"));

/// Displacement class derived from `engine_cc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Kei,
    Standard,
}

impl Category {
    pub fn from_engine_cc(engine_cc: Option<u32>) -> Option<Self> {
        engine_cc.map(|cc| if cc <= KEI_MAX_CC { Category::Kei } else { Category::Standard })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Kei => "kei",
            Category::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionCode {
    #[serde(rename = "AT")]
    At,
    #[serde(rename = "MT")]
    Mt,
    #[serde(rename = "CVT")]
    Cvt,
}

impl TransmissionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmissionCode::At => "AT",
            TransmissionCode::Mt => "MT",
            TransmissionCode::Cvt => "CVT",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "AT" => Some(TransmissionCode::At),
            "MT" => Some(TransmissionCode::Mt),
            "CVT" => Some(TransmissionCode::Cvt),
            _ => None,
        }
    }
}

/// How strictly a text field is checked for corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Short code-like values: body type, transmission, color, fuel.
    Categorical,
    /// Names, addresses, notes.
    FreeText,
}

/// Maps full-width ASCII digits and letters to their half-width forms.
/// Everything else passes through untouched.
pub fn to_halfwidth(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' | 'Ａ'..='Ｚ' | 'ａ'..='ｚ' => {
                char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
            }
            _ => c,
        })
        .collect()
}

/// Half-width text with thousands separators removed, ready for numeric patterns.
fn numeric_text(text: &str) -> String {
    to_halfwidth(text)
        .chars()
        .filter_map(|c| match c {
            ',' | '，' => None,
            '．' => Some('.'),
            _ => Some(c),
        })
        .collect()
}

/// Floors `number * 10^scale` using the decimal digits directly.
fn scaled_floor(number: &str, scale: u32) -> Option<u32> {
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    let mut value: u64 = int_part.parse().ok()?;
    value = value.checked_mul(10u64.checked_pow(scale)?)?;

    let frac_digits: String = frac_part.chars().take(scale as usize).collect();
    if !frac_digits.is_empty() {
        let padded = format!("{:0<width$}", frac_digits, width = scale as usize);
        value = value.checked_add(padded.parse::<u64>().ok()?)?;
    }

    u32::try_from(value).ok()
}

/// Price in man-yen. `"288.4万円"` is 288, a bare `"709"` is 709.
pub fn parse_price(text: Option<&str>) -> Option<u32> {
    let t = numeric_text(text?);
    let t = t.trim();
    if let Some(caps) = PRICE_MAN_RE.captures(t) {
        return scaled_floor(&caps[1], 0);
    }
    BARE_DECIMAL_RE
        .captures(t)
        .and_then(|caps| scaled_floor(&caps[1], 0))
}

/// Four-digit Gregorian model year, from either a Gregorian or an era token.
pub fn parse_year(text: Option<&str>) -> Option<u16> {
    let t = to_halfwidth(text?);
    if let Some(caps) = YEAR_WESTERN_RE.captures(&t) {
        return caps[1].parse().ok();
    }

    let caps = YEAR_ERA_RE.captures(&t)?;
    let era = ERAS.iter().find(|era| era.markers.contains(&&caps[1]))?;
    let era_year: u16 = match &caps[2] {
        "元" => 1,
        digits => digits.parse().ok()?,
    };
    if era_year == 0 {
        return None;
    }
    era.offset.checked_add(era_year)
}

/// Mileage in km. `"3.4万km"` is 34000, `"12,345km"` is 12345.
pub fn parse_mileage(text: Option<&str>) -> Option<u32> {
    let t = numeric_text(text?);
    let caps = MILEAGE_RE.captures(&t)?;
    let scale = if caps.get(2).is_some() { 4 } else { 0 };
    scaled_floor(&caps[1], scale)
}

/// Displacement in cc, from `"1500cc"` or `"2.0L"`.
pub fn parse_engine_cc(text: Option<&str>) -> Option<u32> {
    let t = numeric_text(text?);
    if let Some(caps) = ENGINE_CC_RE.captures(&t) {
        return caps[1].parse().ok();
    }
    ENGINE_LITER_RE
        .captures(&t)
        .and_then(|caps| scaled_floor(&caps[1], 3))
}

/// Seat or door count: the first integer between 1 and 99.
pub fn parse_small_count(text: Option<&str>) -> Option<u8> {
    let t = to_halfwidth(text?);
    let caps = SMALL_COUNT_RE.captures(&t)?;
    caps[1].parse::<u8>().ok().filter(|n| *n > 0)
}

/// Fuel economy in km/L, e.g. `"JC08モード 25.4km/L"`.
pub fn parse_fuel_economy(text: Option<&str>) -> Option<f64> {
    let t = numeric_text(text?);
    let number = FUEL_ECONOMY_RE
        .captures(&t)
        .map(|caps| caps[1].to_string())
        .or_else(|| {
            BARE_DECIMAL_RE
                .captures(t.trim())
                .map(|caps| caps[1].to_string())
        })?;
    number.parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// Transmission family from free text such as `"フロアAT"` or `"CVT"`.
pub fn transmission_code(text: Option<&str>) -> Option<TransmissionCode> {
    let t = to_halfwidth(text?).to_uppercase();
    if t.contains("CVT") {
        return Some(TransmissionCode::Cvt);
    }
    if let Some(caps) = TRANSMISSION_RE.captures(&t) {
        return TransmissionCode::from_label(&caps[1]);
    }
    if t.contains("オートマ") {
        return Some(TransmissionCode::At);
    }
    if t.contains("マニュアル") {
        return Some(TransmissionCode::Mt);
    }
    None
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1F}' | '\u{7F}' | '\u{200B}'..='\u{200D}' | '\u{FEFF}')
}

/// Trims and removes every whitespace (full-width space and newlines included)
/// plus control characters. For values used as codes or categories.
pub fn compact_text(text: Option<&str>) -> Option<String> {
    let cleaned: String = text?
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !is_invisible(*c))
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Trims and removes control characters only, keeping internal spacing.
pub fn free_text(text: Option<&str>) -> Option<String> {
    let cleaned: String = text?.chars().filter(|c| !is_invisible(*c)).collect();
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Removes a column label that leaked into a value (`"ミッションAT"`).
/// A value that is only the label becomes `None`.
pub fn strip_label(value: Option<String>, label: &str) -> Option<String> {
    let value = value?;
    match value.strip_prefix(label) {
        Some(rest) => {
            let rest = rest.trim();
            (!rest.is_empty()).then(|| rest.to_string())
        }
        None => Some(value),
    }
}

pub fn canonical_body_type(value: Option<String>) -> Option<String> {
    let value = value?;
    let canonical = BODY_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| value == *alias)
        .map(|(_, canonical)| canonical.to_string());
    Some(canonical.unwrap_or(value))
}

/// Splits `"トヨタ プリウス 1.8 S"` into maker and model, dropping the
/// grade tokens that start at the first token containing a digit.
pub fn split_maker_model(text: &str) -> (Option<String>, Option<String>) {
    let text = to_halfwidth(text);
    let head: Vec<&str> = text
        .split_whitespace()
        .take_while(|token| !token.chars().any(|c| c.is_ascii_digit()))
        .collect();

    match head.as_slice() {
        [] => (None, free_text(Some(text.as_str()))),
        [only] => (None, Some(only.to_string())),
        [maker, model @ ..] => (Some(maker.to_string()), Some(model.join(" "))),
    }
}

/// True when the text carries a mojibake signature: replacement characters or
/// a run of Latin-1/Latin Extended characters where Japanese is expected.
fn has_decoding_artifacts(value: &str) -> bool {
    if value.contains('\u{FFFD}') {
        return true;
    }
    let mut run = 0;
    for c in value.chars() {
        if ('\u{80}'..='\u{24F}').contains(&c) {
            run += 1;
            if run >= 2 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn longest_ascii_letter_run(value: &str) -> usize {
    value
        .split(|c: char| !c.is_ascii_alphabetic())
        .map(str::len)
        .max()
        .unwrap_or(0)
}

/// Flags a value that looks corrupted. Flagged values are kept; deciding what
/// to do with them belongs to the consumer.
pub fn is_suspicious(value: &str, kind: FieldKind) -> bool {
    if has_decoding_artifacts(value) {
        return true;
    }
    match kind {
        FieldKind::Categorical => {
            value.chars().count() > MAX_CATEGORICAL_CHARS || longest_ascii_letter_run(value) >= 8
        }
        FieldKind::FreeText => false,
    }
}

/// True when a numeric field is outside what a used-car listing can contain.
pub fn implausible_numbers(
    price: Option<u32>,
    year: Option<u16>,
    mileage_km: Option<u32>,
    engine_cc: Option<u32>,
) -> bool {
    price == Some(0)
        || year.is_some_and(|y| !(1900..=2100).contains(&y))
        || mileage_km.is_some_and(|km| km > 2_000_000)
        || engine_cc.is_some_and(|cc| !(50..=10_000).contains(&cc))
}
