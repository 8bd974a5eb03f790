use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::assembler::{assemble, enrich_listings};
use crate::config::{PersistenceMode, PipelineConfig, SiteRunConfig};
use crate::decoder::DecodedPage;
use crate::extractor::{extract_page, extractor_for, SiteExtractor};
use crate::fetch::PageFetcher;
use crate::model::{CanonicalListing, Site};
use crate::pagination::next_page_url;
use crate::store::ListingStore;
use crate::utils::PageDelay;

/// Why a site's page loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    PageBudget,
    LastPage,
    FetchFailed,
    Revisited,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site: Site,
    pub start_url: String,
    pub pages_fetched: usize,
    pub listings: usize,
    pub records_dropped: usize,
    pub stop_reason: StopReason,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub sites: Vec<SiteReport>,
    pub listings_persisted: usize,
}

impl RunReport {
    pub fn pages_fetched(&self) -> usize {
        self.sites.iter().map(|s| s.pages_fetched).sum()
    }
}

/// Everything one site's crawl produced, before persistence.
pub struct SiteCrawl {
    pub report: SiteReport,
    pub listings: Vec<CanonicalListing>,
    /// Decoding decision per fetched page, text dropped.
    pub encodings: Vec<(String, DecodedPage)>,
}

/// Persistence failed; `salvaged` holds every assembled listing so the caller can retry.
#[derive(Debug, Error)]
#[error("persistence failed: {error:#} ({} listings salvaged)", .salvaged.len())]
pub struct RunFailure {
    pub error: anyhow::Error,
    pub salvaged: Vec<CanonicalListing>,
}

/// Sequential page loop: fetch, decode, extract, assemble, navigate.
pub async fn crawl_site(
    fetcher: &dyn PageFetcher,
    extractor: &dyn SiteExtractor,
    site_config: &SiteRunConfig,
    delay: &PageDelay,
) -> SiteCrawl {
    let site = site_config.site;
    let mut listings = Vec::new();
    let mut encodings = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut visited_urls = HashSet::new();
    let mut current_url = site_config.start_url.clone();
    let mut report = SiteReport {
        site,
        start_url: site_config.start_url.clone(),
        pages_fetched: 0,
        listings: 0,
        records_dropped: 0,
        stop_reason: StopReason::PageBudget,
        error: None,
    };

    loop {
        if report.pages_fetched >= site_config.max_pages {
            report.stop_reason = StopReason::PageBudget;
            break;
        }
        if !visited_urls.insert(current_url.clone()) {
            log::info!("[{}] {} was already visited, stopping", site, current_url);
            report.stop_reason = StopReason::Revisited;
            break;
        }
        if report.pages_fetched > 0 {
            delay.wait().await;
        }

        log::info!(
            "[{}] Page {}/{}: {}",
            site,
            report.pages_fetched + 1,
            site_config.max_pages,
            current_url
        );

        let page = match fetcher.fetch(&current_url).await {
            Ok(page) => page,
            Err(e) => {
                log::warn!("[{}] fetch failed for {}: {:#}", site, current_url, e);
                report.stop_reason = StopReason::FetchFailed;
                report.error = Some(format!("{:#}", e));
                break;
            }
        };
        report.pages_fetched += 1;

        let mut decoded = page.decode();
        log::debug!(
            "[{}] decoded {} as {} (score {:.3}, confident {})",
            site,
            page.url,
            decoded.encoding,
            decoded.score,
            decoded.confident
        );

        let extraction = extract_page(extractor, &decoded.text);
        report.records_dropped += extraction.dropped;
        let found = extraction.records.len();
        for record in extraction.records {
            if seen_ids.insert(record.id.clone()) {
                listings.push(assemble(site, record));
            }
        }
        log::info!(
            "[{}] page {}: {} records ({} dropped)",
            site,
            report.pages_fetched,
            found,
            extraction.dropped
        );

        let next = next_page_url(site, &decoded.text, &page.url);
        decoded.text = String::new();
        encodings.push((page.url, decoded));

        match next {
            Some(url) => current_url = url,
            None => {
                report.stop_reason = StopReason::LastPage;
                break;
            }
        }
    }

    report.listings = listings.len();
    SiteCrawl {
        report,
        listings,
        encodings,
    }
}

/// Crawls every configured site, enriching from detail pages when enabled.
pub async fn crawl_all(config: &PipelineConfig, fetcher: &dyn PageFetcher) -> Result<Vec<SiteCrawl>> {
    let delay = PageDelay::new(config.page_delay_ms);
    let mut crawls = Vec::with_capacity(config.sites.len());

    for site_config in &config.sites {
        let extractor = extractor_for(site_config.site)?;
        let mut crawl = crawl_site(fetcher, extractor.as_ref(), site_config, &delay).await;

        if config.enrich_details && !crawl.listings.is_empty() {
            crawl.listings = enrich_listings(
                fetcher,
                extractor.as_ref(),
                crawl.listings,
                config.enrich_parallelism,
            )
            .await;
        }
        crawls.push(crawl);
    }

    Ok(crawls)
}

fn persist(
    config: &PipelineConfig,
    store: &mut ListingStore,
    crawls: &[SiteCrawl],
) -> Result<usize> {
    let mut persisted = 0;
    for crawl in crawls {
        let site = crawl.report.site;
        match config.persistence {
            // An unreachable site must not wipe its stored collection.
            PersistenceMode::Snapshot if crawl.report.pages_fetched == 0 => {
                log::warn!("[{}] no pages fetched, keeping stored snapshot", site);
            }
            PersistenceMode::Snapshot => {
                persisted += store.replace_collection(site, &crawl.listings)?;
            }
            PersistenceMode::Upsert => {
                persisted += store.upsert_listings(&crawl.listings)?;
            }
        }

        if config.log_encodings {
            for (url, page) in &crawl.encodings {
                store.record_encoding(site, url, page)?;
            }
        }
    }
    Ok(persisted)
}

/// Runs the whole pipeline and hands every listing to `store`.
pub async fn run_and_persist(
    config: &PipelineConfig,
    fetcher: &dyn PageFetcher,
    store: &mut ListingStore,
) -> Result<RunReport, RunFailure> {
    let run_id = Uuid::new_v4().to_string();
    let started_at = Utc::now().to_rfc3339();
    log::info!("Run {} started for {} site(s)", run_id, config.sites.len());

    let crawls = crawl_all(config, fetcher).await.map_err(|error| RunFailure {
        error,
        salvaged: Vec::new(),
    })?;

    let persisted = match persist(config, store, &crawls) {
        Ok(count) => count,
        Err(error) => {
            let salvaged: Vec<CanonicalListing> =
                crawls.into_iter().flat_map(|crawl| crawl.listings).collect();
            log::error!(
                "Run {} could not persist {} listings: {:#}",
                run_id,
                salvaged.len(),
                error
            );
            return Err(RunFailure { error, salvaged });
        }
    };

    let report = RunReport {
        run_id,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        sites: crawls.into_iter().map(|crawl| crawl.report).collect(),
        listings_persisted: persisted,
    };
    log::info!(
        "Run {} finished: {} pages, {} listings persisted",
        report.run_id,
        report.pages_fetched(),
        report.listings_persisted
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::MapFetcher;

    const CS_PAGE_1: &str = "https://www.carsensor.net/usedcar/hokkaido/index.html";
    const CS_PAGE_2: &str = "https://www.carsensor.net/usedcar/hokkaido/index2.html";

    fn cs_card(id: &str, name: &str, price: &str) -> String {
        format!(
            r#"<article><h2>{name}</h2><em>{price}</em><span>2020年</span>
            <a href="/usedcar/detail/{id}/index.html">詳細</a></article>"#
        )
    }

    fn cs_page(cards: &[String], pager: &str) -> String {
        format!(
            "<html><body><section>{}</section>{}</body></html>",
            cards.concat(),
            pager
        )
    }

    fn carsensor_config(max_pages: usize) -> PipelineConfig {
        PipelineConfig {
            sites: vec![SiteRunConfig {
                site: Site::CarSensor,
                start_url: CS_PAGE_1.to_string(),
                max_pages,
            }],
            page_delay_ms: 1,
            ..PipelineConfig::default()
        }
    }

    fn two_page_fetcher() -> MapFetcher {
        MapFetcher::default()
            .with_page(
                CS_PAGE_1,
                &cs_page(
                    &[
                        cs_card("AU1000000001", "マツダ CX-5 XD", "255万円"),
                        cs_card("AU1000000002", "トヨタ アクア S", "98万円"),
                    ],
                    r#"<a href="/usedcar/hokkaido/index2.html">2</a>"#,
                ),
            )
            .with_page(
                CS_PAGE_2,
                &cs_page(
                    &[
                        cs_card("AU1000000002", "トヨタ アクア S", "98万円"),
                        cs_card("AU1000000003", "ホンダ フィット", "110万円"),
                    ],
                    r#"<a href="/usedcar/hokkaido/index.html">1</a>"#,
                ),
            )
    }

    #[tokio::test]
    async fn test_crawl_follows_pages_until_last() {
        let fetcher = two_page_fetcher();
        let config = carsensor_config(5);
        let extractor = extractor_for(Site::CarSensor).unwrap();
        let delay = PageDelay::new(config.page_delay_ms);

        let crawl = crawl_site(&fetcher, extractor.as_ref(), &config.sites[0], &delay).await;

        assert_eq!(fetcher.requested(), vec![CS_PAGE_1, CS_PAGE_2]);
        assert_eq!(crawl.report.pages_fetched, 2);
        assert_eq!(crawl.report.stop_reason, StopReason::LastPage);
        let ids: Vec<&str> = crawl.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["AU1000000001", "AU1000000002", "AU1000000003"]);
        assert_eq!(crawl.listings[0].price, Some(255));
        assert_eq!(crawl.encodings.len(), 2);
        assert!(crawl.encodings.iter().all(|(_, page)| page.text.is_empty()));
    }

    #[tokio::test]
    async fn test_crawl_respects_page_budget() {
        let fetcher = two_page_fetcher();
        let config = carsensor_config(1);
        let extractor = extractor_for(Site::CarSensor).unwrap();

        let crawl = crawl_site(
            &fetcher,
            extractor.as_ref(),
            &config.sites[0],
            &PageDelay::new(1),
        )
        .await;

        assert_eq!(fetcher.requested(), vec![CS_PAGE_1]);
        assert_eq!(crawl.report.stop_reason, StopReason::PageBudget);
        assert_eq!(crawl.listings.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_partial_results() {
        let fetcher = MapFetcher::default().with_page(
            CS_PAGE_1,
            &cs_page(
                &[cs_card("AU1000000001", "マツダ CX-5 XD", "255万円")],
                r#"<a href="/usedcar/hokkaido/index2.html">2</a>"#,
            ),
        );
        let extractor = extractor_for(Site::CarSensor).unwrap();
        let config = carsensor_config(5);

        let crawl = crawl_site(
            &fetcher,
            extractor.as_ref(),
            &config.sites[0],
            &PageDelay::new(1),
        )
        .await;

        assert_eq!(crawl.report.stop_reason, StopReason::FetchFailed);
        assert!(crawl.report.error.is_some());
        assert_eq!(crawl.report.pages_fetched, 1);
        assert_eq!(crawl.listings.len(), 1);
    }

    #[tokio::test]
    async fn test_revisited_url_stops_the_loop() {
        let a = "https://www.goo-net.com/usedcar/a.html";
        let b = "https://www.goo-net.com/usedcar/b.html";
        let fetcher = MapFetcher::default()
            .with_page(a, r#"<a rel="next" href="/usedcar/b.html">2</a>"#)
            .with_page(b, r#"<a rel="next" href="/usedcar/a.html">1</a>"#);
        let site_config = SiteRunConfig {
            site: Site::Goo,
            start_url: a.to_string(),
            max_pages: 10,
        };
        let extractor = extractor_for(Site::Goo).unwrap();

        let crawl = crawl_site(&fetcher, extractor.as_ref(), &site_config, &PageDelay::new(1)).await;

        assert_eq!(fetcher.requested(), vec![a, b]);
        assert_eq!(crawl.report.stop_reason, StopReason::Revisited);
        assert!(crawl.listings.is_empty());
    }

    #[tokio::test]
    async fn test_run_and_persist_snapshot() {
        let fetcher = two_page_fetcher();
        let config = carsensor_config(5);
        let mut store = ListingStore::new_in_memory().unwrap();

        let report = run_and_persist(&config, &fetcher, &mut store).await.unwrap();

        assert_eq!(report.listings_persisted, 3);
        assert_eq!(report.pages_fetched(), 2);
        assert_eq!(store.count(Site::CarSensor).unwrap(), 3);
        assert_eq!(store.encoding_log(Site::CarSensor).unwrap().len(), 2);
        assert!(Uuid::parse_str(&report.run_id).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_site_keeps_snapshot() {
        let mut store = ListingStore::new_in_memory().unwrap();
        store
            .upsert_listings(&[CanonicalListing::empty(Site::CarSensor, "AU1")])
            .unwrap();

        let report = run_and_persist(&carsensor_config(5), &MapFetcher::default(), &mut store)
            .await
            .unwrap();

        assert_eq!(report.sites[0].stop_reason, StopReason::FetchFailed);
        assert_eq!(store.count(Site::CarSensor).unwrap(), 1);
    }

    #[test]
    fn test_run_failure_display() {
        let failure = RunFailure {
            error: anyhow::anyhow!("database is locked"),
            salvaged: vec![
                CanonicalListing::empty(Site::Goo, "1"),
                CanonicalListing::empty(Site::Goo, "2"),
            ],
        };
        assert_eq!(
            failure.to_string(),
            "persistence failed: database is locked (2 listings salvaged)"
        );
    }
}
