use anyhow::Result;
use scraper::{ElementRef, Selector};
use std::sync::LazyLock;

use crate::extractor::{
    element_text, looks_like_location, probe_text, CompiledPatterns, PageContext, SiteExtractor,
};
use crate::model::{Field, RawRecord};
use crate::patterns::{self, MAX_LOCATION_CHARS};

/// A probed location longer than this is re-read from the spans of the row.
const PROBED_LOCATION_MAX_CHARS: usize = 25;

static TITLE_ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div > h3 > a").expect("title anchor selector"));
static HEADING_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h3").expect("heading selector"));
static HEADING_ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h3 a[href]").expect("heading anchor selector"));
static SPAN_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span").expect("span selector"));

/// Goo-net rows: `tr_<id>` holds the card, a sibling `td_<id>` holds the title.
pub struct GooExtractor {
    compiled: CompiledPatterns,
}

impl GooExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            compiled: CompiledPatterns::new(&patterns::GOO)?,
        })
    }

    fn read_title(&self, page: &PageContext<'_>, card: ElementRef<'_>, record: &mut RawRecord) {
        let title_block = page.by_id(&format!("td_{}", record.id));

        if let Some(anchor) = title_block.and_then(|block| block.select(&TITLE_ANCHOR_SELECTOR).next()) {
            if let Some(href) = anchor.value().attr("href") {
                record.set(Field::DetailUrl, href);
            }
            match probe_text(anchor, "p[2]/span") {
                Ok(model) => record.set(Field::Name, model),
                Err(e) => log::debug!("[{}] model name: {}", record.id, e),
            }
            if let Ok(maker) = probe_text(anchor, "p[1]") {
                record.set(Field::Manufacturer, maker);
            }
        }

        if record.get(Field::Name).is_none() {
            let heading = title_block
                .and_then(|block| block.select(&HEADING_SELECTOR).next())
                .or_else(|| card.select(&HEADING_SELECTOR).next());
            if let Some(heading) = heading {
                record.set(Field::Name, element_text(heading));
            }
        }

        if record.get(Field::DetailUrl).is_none() {
            if let Some(href) = card
                .select(&HEADING_ANCHOR_SELECTOR)
                .next()
                .and_then(|anchor| anchor.value().attr("href"))
            {
                record.set(Field::DetailUrl, href);
            }
        }
    }

    fn read_location(&self, container: ElementRef<'_>, record: &mut RawRecord) {
        let probed = record.get(Field::Location).map(|l| l.chars().count());
        if probed.is_none_or(|len| len > PROBED_LOCATION_MAX_CHARS) {
            if let Some(location) = container
                .select(&SPAN_SELECTOR)
                .map(element_text)
                .find(|text| looks_like_location(text))
            {
                record.fields.insert(Field::Location, location);
            }
        }

        if record
            .get(Field::Location)
            .is_some_and(|l| l.chars().count() > MAX_LOCATION_CHARS)
        {
            record.fields.remove(&Field::Location);
        }
    }
}

impl SiteExtractor for GooExtractor {
    fn compiled(&self) -> &CompiledPatterns {
        &self.compiled
    }

    fn extract_site_fields(
        &self,
        page: &PageContext<'_>,
        container: ElementRef<'_>,
        card: ElementRef<'_>,
        record: &mut RawRecord,
    ) {
        self.read_title(page, card, record);
        self.read_location(container, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::extractor::extract_page;
    use crate::model::{Site, Strategy};
    use crate::normalize::{Category, TransmissionCode};

    struct Card<'a> {
        id: &'a str,
        price: &'a str,
        year: &'a str,
        mileage: &'a str,
        engine: &'a str,
        location: &'a str,
    }

    fn row(card: &Card<'_>) -> String {
        format!(
            r#"<div id="tr_{id}">
  <div>
    <div>photo</div>
    <div><div>
      <div>badge</div>
      <div>
        <div><div><div><p>支払総額</p><p><em>{price}</em>万円</p></div></div></div>
        <div>
          <div><ul><li>{year}</li><li>{mileage}</li><li>車検整備付</li><li>{engine}</li><li>修復歴なし</li></ul></div>
          <div><div>パールホワイト<br>
CVT<br>
ミニバン・ワンボックス</div></div>
        </div>
      </div>
    </div></div>
  </div>
  <div>dealer</div>
  <div><div><div><div><div><span>{location}</span></div></div></div></div></div>
</div>
<div id="td_{id}"><div><h3><a href="/usedcar/spread/goo/13/{id}.html"><p>トヨタ</p><p><span>アルファード</span></p></a></h3></div></div>"#,
            id = card.id,
            price = card.price,
            year = card.year,
            mileage = card.mileage,
            engine = card.engine,
            location = card.location,
        )
    }

    fn page(rows: &[String]) -> String {
        format!("<html><body><div id=\"resultArea\">{}</div></body></html>", rows.join("\n"))
    }

    const X1: Card<'static> = Card {
        id: "700080123430250512001",
        price: "288.4",
        year: "2019(R01)年",
        mileage: "3.2万km",
        engine: "2490cc",
        location: "岡山県岡山市南区",
    };

    const X2: Card<'static> = Card {
        id: "700080123430250512002",
        price: "１４９．８",
        year: "H30年",
        mileage: "",
        engine: "660cc",
        location: "東京都練馬区",
    };

    #[test]
    fn test_structural_extraction() {
        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, &page(&[row(&X1)]));

        assert_eq!(extraction.containers_found, 1);
        let record = &extraction.records[0];
        assert_eq!(record.id, X1.id);
        assert_eq!(record.strategy, Strategy::Structural);
        assert_eq!(record.get(Field::Price), Some("288.4"));
        assert_eq!(record.get(Field::Year), Some("2019(R01)年"));
        assert_eq!(record.get(Field::Mileage), Some("3.2万km"));
        assert_eq!(record.get(Field::Engine), Some("2490cc"));
        assert_eq!(record.get(Field::AccidentNote), Some("修復歴なし"));
        assert_eq!(record.get(Field::Color), Some("パールホワイト"));
        assert_eq!(record.get(Field::Transmission), Some("CVT"));
        assert_eq!(record.get(Field::BodyType), Some("ミニバン・ワンボックス"));
        assert_eq!(record.get(Field::Location), Some("岡山県岡山市南区"));
        assert_eq!(record.get(Field::Name), Some("アルファード"));
        assert_eq!(record.get(Field::Manufacturer), Some("トヨタ"));
        assert_eq!(
            record.get(Field::DetailUrl),
            Some("/usedcar/spread/goo/13/700080123430250512001.html")
        );
    }

    #[test]
    fn test_container_without_id_is_dropped() {
        let broken = row(&X1).replace("tr_700080123430250512001", "tr_");
        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, &page(&[broken, row(&X2)]));

        assert_eq!(extraction.containers_found, 2);
        assert_eq!(extraction.dropped, 1);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0].id, X2.id);
    }

    #[test]
    fn test_drifted_price_path_does_not_take_mileage() {
        let drifted = row(&X1).replace("<em>288.4</em>", "<span><em>288.4</em></span>");
        let extractor = GooExtractor::new().unwrap();
        let mut extraction = extract_page(&extractor, &page(&[drifted]));

        let record = extraction.records.remove(0);
        assert_eq!(record.get(Field::Price), Some("288.4"));
        assert_eq!(record.strategy, Strategy::PatternFallback);
        assert!(record.pattern_fields.contains(&Field::Price));

        let listing = assemble(Site::Goo, record);
        assert_eq!(listing.price, Some(288));
        assert_eq!(listing.mileage_km, Some(32000));
    }

    #[test]
    fn test_malformed_row_keeps_its_record() {
        let gutted = r#"<div id="tr_700080123430250512009"><p>x</p></div>"#.to_string();
        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, &page(&[row(&X1), gutted, row(&X2)]));

        assert_eq!(extraction.containers_found, 3);
        assert_eq!(extraction.dropped, 0);
        assert_eq!(extraction.records.len(), 3);

        let ids: Vec<&str> = extraction.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![X1.id, "700080123430250512009", X2.id]);

        let gutted = assemble(Site::Goo, extraction.records[1].clone());
        assert_eq!(gutted.name, None);
        assert_eq!(gutted.price, None);
        assert_eq!(gutted.year, None);
        assert_eq!(gutted.mileage_km, None);
        assert_eq!(gutted.engine_cc, None);
        assert_eq!(gutted.category, None);
        assert_eq!(gutted.dealer_location, None);
        assert_eq!(gutted.detail_url, None);
        assert!(gutted.raw_fragments.fields.is_empty());

        assert_eq!(extraction.records[2].get(Field::Engine), Some("660cc"));
    }

    #[test]
    fn test_duplicate_rows_are_skipped() {
        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, &page(&[row(&X1), row(&X1)]));
        assert_eq!(extraction.records.len(), 1);
    }

    #[test]
    fn test_end_to_end_missing_mileage() {
        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, &page(&[row(&X1), row(&X2)]));
        let listings: Vec<_> = extraction
            .records
            .into_iter()
            .map(|record| assemble(Site::Goo, record))
            .collect();

        assert_eq!(listings.len(), 2);

        let x1 = &listings[0];
        assert_eq!(x1.price, Some(288));
        assert_eq!(x1.year, Some(2019));
        assert_eq!(x1.mileage_km, Some(32000));
        assert_eq!(x1.engine_cc, Some(2490));
        assert_eq!(x1.category, Some(Category::Standard));
        assert_eq!(x1.transmission_code, Some(TransmissionCode::Cvt));
        assert_eq!(x1.body_type.as_deref(), Some("ミニバン"));
        assert_eq!(x1.manufacturer.as_deref(), Some("トヨタ"));
        assert_eq!(
            x1.detail_url.as_deref(),
            Some("https://www.goo-net.com/usedcar/spread/goo/13/700080123430250512001.html")
        );
        assert!(!x1.suspicious);

        let x2 = &listings[1];
        assert_eq!(x2.price, Some(149));
        assert_eq!(x2.year, Some(2018));
        assert_eq!(x2.mileage_km, None);
        assert_eq!(x2.engine_cc, Some(660));
        assert_eq!(x2.category, Some(Category::Kei));
        assert_eq!(x2.dealer_location.as_deref(), Some("東京都練馬区"));
    }

    #[test]
    fn test_anchor_discovery_when_no_rows() {
        let html = r#"<html><body><ul>
            <li><h3>日産 ノート e-POWER</h3><p>99.8万円</p><a href="/usedcar/spread/goo/13/700080123456.html">詳細</a></li>
            <li><h3>ホンダ N-BOX</h3><p>120万円</p><a href="/usedcar/spread/goo/13/700080123457.html">詳細</a></li>
        </ul></body></html>"#;

        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, html);

        assert_eq!(extraction.containers_found, 0);
        assert_eq!(extraction.records.len(), 2);
        let first = &extraction.records[0];
        assert_eq!(first.id, "700080123456");
        assert_eq!(first.strategy, Strategy::AnchorDiscovery);
        assert_eq!(first.get(Field::Name), Some("日産 ノート e-POWER"));
        assert_eq!(first.get(Field::Price), Some("99.8万円"));
        assert_eq!(first.pattern_fields, vec![Field::Price]);
    }

    #[test]
    fn test_page_without_listings_is_empty() {
        let extractor = GooExtractor::new().unwrap();
        let extraction = extract_page(&extractor, "<html><body><p>メンテナンス中</p></body></html>");
        assert!(extraction.records.is_empty());
        assert_eq!(extraction.dropped, 0);
    }
}
