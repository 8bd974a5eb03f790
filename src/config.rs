use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::model::Site;

fn default_max_pages() -> usize {
    5
}

fn default_page_delay_ms() -> u64 {
    1000
}

fn default_enrich_parallelism() -> usize {
    1
}

fn default_database_path() -> String {
    "listings.db".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

/// One site to crawl in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRunConfig {
    pub site: Site,
    pub start_url: String,
    /// Page budget; the run stops after this many listing pages.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl SiteRunConfig {
    /// Default search entry point of a site.
    pub fn for_site(site: Site) -> Self {
        let start_url = match site {
            Site::Goo => "https://www.goo-net.com/php/search/summary.php",
            Site::CarSensor => "https://www.carsensor.net/usedcar/index.html",
        };
        Self {
            site,
            start_url: start_url.to_string(),
            max_pages: default_max_pages(),
        }
    }
}

/// How a run's listings reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Replace every stored row of the site with this run's listings.
    #[default]
    Snapshot,
    /// Insert or update by `(site, id)`; never delete.
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sites: Vec<SiteRunConfig>,
    /// Fixed pause between successive page fetches.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default)]
    pub enrich_details: bool,
    /// Concurrent detail-page requests during enrichment.
    #[serde(default = "default_enrich_parallelism")]
    pub enrich_parallelism: usize,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub persistence: PersistenceMode,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Record the chosen encoding of every page in `encoding_log`.
    #[serde(default = "default_true")]
    pub log_encodings: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sites: Site::ALL.into_iter().map(SiteRunConfig::for_site).collect(),
            page_delay_ms: default_page_delay_ms(),
            enrich_details: false,
            enrich_parallelism: default_enrich_parallelism(),
            database_path: default_database_path(),
            persistence: PersistenceMode::default(),
            request_timeout_secs: default_request_timeout_secs(),
            log_encodings: true,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text).context("Failed to parse TOML")?;
        if config.sites.is_empty() {
            config.sites = Self::default().sites;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_delay_ms == 0 {
            bail!("page_delay_ms must be greater than 0");
        }
        if self.enrich_parallelism == 0 {
            bail!("enrich_parallelism must be at least 1");
        }
        for site in &self.sites {
            if site.max_pages == 0 {
                bail!("max_pages for {} must be at least 1", site.site);
            }
            let url = Url::parse(&site.start_url)
                .with_context(|| format!("Invalid start_url for {}: {}", site.site, site.start_url))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("start_url for {} must be http(s): {}", site.site, site.start_url);
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn site(&self, site: Site) -> Option<&SiteRunConfig> {
        self.sites.iter().find(|s| s.site == site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.enrich_parallelism, 1);
        assert_eq!(config.persistence, PersistenceMode::Snapshot);
    }

    #[test]
    fn test_config_from_toml() {
        let text = r#"
            page_delay_ms = 1500
            enrich_details = true
            persistence = "upsert"

            [[sites]]
            site = "carsensor"
            start_url = "https://www.carsensor.net/usedcar/hokkaido/index.html"
            max_pages = 3
        "#;

        let config = PipelineConfig::from_toml(text).unwrap();
        assert_eq!(config.page_delay_ms, 1500);
        assert!(config.enrich_details);
        assert_eq!(config.persistence, PersistenceMode::Upsert);
        assert_eq!(config.sites.len(), 1);
        assert_eq!(config.sites[0].site, Site::CarSensor);
        assert_eq!(config.sites[0].max_pages, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_zero_delay_is_rejected() {
        assert!(PipelineConfig::from_toml("page_delay_ms = 0").is_err());
    }

    #[test]
    fn test_bad_start_url_is_rejected() {
        let text = r#"
            [[sites]]
            site = "goo"
            start_url = "ftp://www.goo-net.com/"
        "#;
        assert!(PipelineConfig::from_toml(text).is_err());
    }
}
