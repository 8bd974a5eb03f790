use anyhow::Result;
use scraper::{ElementRef, Selector};
use std::sync::LazyLock;

use crate::extractor::{element_text, CompiledPatterns, PageContext, SiteExtractor};
use crate::model::{Field, RawRecord};
use crate::patterns::{self, ACCIDENT_TOKEN};

static LI_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("li").expect("li selector"));
static DETAIL_LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"a[href*="/usedcar/detail/"]"#).expect("detail link selector")
});

/// CarSensor cards: `AU<digits>..._cas` containers, everything inside the card.
pub struct CarSensorExtractor {
    compiled: CompiledPatterns,
}

impl CarSensorExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            compiled: CompiledPatterns::new(&patterns::CARSENSOR)?,
        })
    }
}

impl SiteExtractor for CarSensorExtractor {
    fn compiled(&self) -> &CompiledPatterns {
        &self.compiled
    }

    fn extract_site_fields(
        &self,
        _page: &PageContext<'_>,
        container: ElementRef<'_>,
        _card: ElementRef<'_>,
        record: &mut RawRecord,
    ) {
        // No fixed position for the repair history.
        if record.get(Field::AccidentNote).is_none() {
            if let Some(note) = container
                .select(&LI_SELECTOR)
                .map(element_text)
                .find(|text| text.contains(ACCIDENT_TOKEN))
            {
                record.set(Field::AccidentNote, note);
            }
        }

        if record.get(Field::DetailUrl).is_none() {
            let id = record.id.clone();
            if let Some(href) = container
                .select(&DETAIL_LINK_SELECTOR)
                .filter_map(|anchor| anchor.value().attr("href"))
                .find(|href| href.contains(id.as_str()))
            {
                record.set(Field::DetailUrl, href);
            }
        }
    }
}
