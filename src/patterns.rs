//! Per-site selector and structural path tables.
//!
//! Markup drifts; when a site changes, this file is what gets edited. Each
//! table carries a version string that is recorded with every listing so stored
//! rows can be traced back to the patterns that produced them.

use crate::model::{Field, Site};

/// Where a structural path starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRoot {
    /// The element carrying the id convention.
    Container,
    /// The card element inside the container (`card_path`), else the container.
    Card,
}

/// Ordered structural paths for one field. The first path that resolves to
/// non-empty text wins.
#[derive(Debug, Clone, Copy)]
pub struct FieldProbe {
    pub field: Field,
    pub root: ProbeRoot,
    pub paths: &'static [&'static str],
}

/// A fixed pager position used when every dynamic next-page strategy fails.
#[derive(Debug, Clone, Copy)]
pub struct StaticNext {
    /// `id` of the element the path starts from.
    pub root_id: &'static str,
    pub path: &'static str,
    /// Attributes read in order.
    pub attributes: &'static [&'static str],
    /// When set, the URL is the first match of this regex inside the attribute
    /// value rather than the whole value.
    pub embedded_url: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct SitePatterns {
    pub site: Site,
    pub version: &'static str,
    /// CSS selector matching every listing container.
    pub container_selector: &'static str,
    /// Regex over the container `id`; capture group 1 is the listing id.
    pub container_id_pattern: &'static str,
    pub card_path: Option<&'static str>,
    pub field_probes: &'static [FieldProbe],
    /// Remarks block split into color / transmission / body type lines.
    pub remarks_paths: &'static [&'static str],
    /// Regex over anchor hrefs; capture group 1 is the listing id.
    pub detail_anchor_pattern: &'static str,
    pub static_next: &'static [StaticNext],
}

pub static GOO: SitePatterns = SitePatterns {
    site: Site::Goo,
    version: "goo-2025.1",
    container_selector: r#"[id^="tr_"]"#,
    container_id_pattern: r"^tr_(.+)$",
    card_path: Some("div[1]"),
    field_probes: &[
        FieldProbe {
            field: Field::Price,
            root: ProbeRoot::Card,
            paths: &["div[2]/div/div[2]/div[1]/div/div[1]/p[2]/em"],
        },
        FieldProbe {
            field: Field::Year,
            root: ProbeRoot::Card,
            paths: &["div[2]/div/div[2]/div[2]/div[1]/ul/li[1]"],
        },
        FieldProbe {
            field: Field::Mileage,
            root: ProbeRoot::Card,
            paths: &["div[2]/div/div[2]/div[2]/div[1]/ul/li[2]"],
        },
        FieldProbe {
            field: Field::Engine,
            root: ProbeRoot::Card,
            paths: &["div[2]/div/div[2]/div[2]/div[1]/ul/li[4]"],
        },
        FieldProbe {
            field: Field::AccidentNote,
            root: ProbeRoot::Card,
            paths: &["div[2]/div/div[2]/div[2]/div[1]/ul/li[5]"],
        },
        FieldProbe {
            field: Field::Location,
            root: ProbeRoot::Container,
            paths: &["div[3]/div/div[1]/div[1]/div/span"],
        },
    ],
    remarks_paths: &[
        "div[2]/div/div[2]/div[2]/div[2]/div[2]/div[1]",
        "div[2]/div/div[2]/div[2]/div[2]/div[1]",
    ],
    detail_anchor_pattern: r"/usedcar/spread/goo/\d+/(\d{10,})\.html",
    static_next: &[
        StaticNext {
            root_id: "resultArea",
            path: "div/div/div/div[2]/div/div/div[2]/ul/li[6]/a",
            attributes: &["href"],
            embedded_url: None,
        },
        StaticNext {
            root_id: "resultArea",
            path: "div/div/div/div[2]/div/div/div[2]/ul/li[8]/a",
            attributes: &["href"],
            embedded_url: None,
        },
    ],
};

pub static CARSENSOR: SitePatterns = SitePatterns {
    site: Site::CarSensor,
    version: "carsensor-2025.1",
    container_selector: r#"[id^="AU"][id*="_cas"]"#,
    container_id_pattern: r"(AU\d+)",
    card_path: None,
    field_probes: &[
        FieldProbe {
            field: Field::Name,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[2]/h3/a"],
        },
        FieldProbe {
            field: Field::Price,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[2]/div[2]/div[1]/div[1]/div[1]/p[2]"],
        },
        FieldProbe {
            field: Field::Year,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[2]/div[2]/div[2]/dl/div[1]/dd/span[1]"],
        },
        FieldProbe {
            field: Field::Mileage,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[2]/div[2]/div[2]/dl/div[2]/dd"],
        },
        FieldProbe {
            field: Field::Engine,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[2]/div[2]/div[2]/dl/div[7]/dd"],
        },
        FieldProbe {
            field: Field::Transmission,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[2]/div[2]/div[2]/dl/div[8]/dd"],
        },
        FieldProbe {
            field: Field::BodyType,
            root: ProbeRoot::Container,
            paths: &["div[1]/div/div[1]/ul/li[1]"],
        },
        FieldProbe {
            field: Field::Location,
            root: ProbeRoot::Container,
            paths: &["div[2]/div[1]"],
        },
    ],
    remarks_paths: &[],
    detail_anchor_pattern: r"/usedcar/detail/(AU[0-9]+)/",
    static_next: &[StaticNext {
        root_id: "js-resultBar",
        path: "div[2]/div/div[2]/button[2]",
        attributes: &["data-url", "data-href", "data-link", "onclick"],
        embedded_url: Some(r#"/usedcar/[^"']+index\d+\.html"#),
    }],
};

pub fn for_site(site: Site) -> &'static SitePatterns {
    match site {
        Site::Goo => &GOO,
        Site::CarSensor => &CARSENSOR,
    }
}

/// Anchor texts that mean "next page", matched at the start of the text.
pub const NEXT_TOKENS: &[&str] = &["次", "次へ", "次の"];
/// `次回` is "next time", not a pager link.
pub const NEXT_EXCLUDED_PREFIXES: &[&str] = &["次回"];
/// Longer anchor texts are prose, not pager links.
pub const MAX_NEXT_TEXT_CHARS: usize = 6;

pub const PREFECTURE_SUFFIXES: &[char] = &['都', '道', '府', '県'];
pub const MIN_LOCATION_CHARS: usize = 3;
pub const MAX_LOCATION_CHARS: usize = 30;

pub const ACCIDENT_TOKEN: &str = "修復";
pub const TRANSMISSION_TOKENS: &[&str] = &["CVT", "AT", "MT", "ミッション"];
pub const BODY_TYPE_KEYWORDS: &[&str] = &[
    "SUV",
    "ミニバン",
    "ワゴン",
    "セダン",
    "ハッチバック",
    "トラック",
    "クーペ",
    "オープン",
    "バン",
];

/// Column labels that leak into values on some layouts.
pub const TRANSMISSION_LABEL: &str = "ミッション";
pub const BODY_TYPE_LABEL: &str = "ボディタイプ";

/// Ancestor levels climbed from a detail anchor to approximate its card.
pub const ANCESTOR_CLIMB_LIMIT: usize = 5;
/// Tags that mark a card boundary once they hold at least two element children.
pub const CARD_TAGS: &[&str] = &["article", "li", "tr"];

/// Detail-page labels and the fields they fill.
pub const DETAIL_LABELS: &[(&str, Field)] = &[
    ("駆動方式", Field::Drivetrain),
    ("乗車定員", Field::Seats),
    ("ドア数", Field::Doors),
    ("燃料", Field::FuelType),
    ("ハンドル", Field::Steering),
    ("燃費", Field::FuelEconomy),
    ("ミッション", Field::Transmission),
    ("排気量", Field::Engine),
    ("年式", Field::Year),
    ("走行距離", Field::Mileage),
    ("修復歴", Field::AccidentNote),
    ("ボディタイプ", Field::BodyType),
    ("本体色", Field::Color),
];

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use scraper::Selector;

    #[test]
    fn test_every_pattern_compiles() {
        for patterns in [&GOO, &CARSENSOR] {
            assert!(Selector::parse(patterns.container_selector).is_ok());
            assert!(Regex::new(patterns.container_id_pattern).is_ok());
            assert!(Regex::new(patterns.detail_anchor_pattern).is_ok());
            for next in patterns.static_next {
                if let Some(embedded) = next.embedded_url {
                    assert!(Regex::new(embedded).is_ok());
                }
            }
        }
    }

    #[test]
    fn test_structural_paths_expand() {
        let year = GOO
            .field_probes
            .iter()
            .find(|probe| probe.field == Field::Year)
            .unwrap();
        assert_eq!(year.paths[0], "div[2]/div/div[2]/div[2]/div[1]/ul/li[1]");

        let engine = CARSENSOR
            .field_probes
            .iter()
            .find(|probe| probe.field == Field::Engine)
            .unwrap();
        assert_eq!(engine.paths[0], "div[1]/div/div[2]/div[2]/div[2]/dl/div[7]/dd");
    }

    #[test]
    fn test_detail_labels_are_unique() {
        let mut labels: Vec<&str> = DETAIL_LABELS.iter().map(|(label, _)| *label).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), DETAIL_LABELS.len());
    }
}
