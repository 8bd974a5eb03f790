use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::decoder::{charset_from_content_type, decode_bytes, DecodeHints, DecodedPage};
use crate::utils::{get_random_user_agent, tld_of};

/// Raw response of one page request.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedPage {
    pub fn decode(&self) -> DecodedPage {
        let header_charset = self
            .content_type
            .as_deref()
            .and_then(charset_from_content_type);
        let tld = tld_of(&self.url);
        decode_bytes(
            &self.bytes,
            &DecodeHints {
                header_charset: header_charset.as_deref(),
                tld: tld.as_deref(),
            },
        )
    }
}

/// Source of page bytes. Retry and backoff policies live behind this trait.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", get_random_user_agent())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "ja,en-US;q=0.7,en;q=0.3")
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP error {} for {}", response.status(), url);
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .context("Failed to read response body")?
            .to_vec();

        log::debug!("fetched {} ({} bytes)", final_url, bytes.len());
        Ok(FetchedPage {
            url: final_url,
            bytes,
            content_type,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned pages and records every requested URL.
    #[derive(Default)]
    pub struct MapFetcher {
        pages: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        pub fn with_page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.as_bytes().to_vec());
            self
        }

        pub fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            self.requested.lock().unwrap().push(url.to_string());
            let bytes = self
                .pages
                .get(url)
                .cloned()
                .with_context(|| format!("HTTP error 404 Not Found for {}", url))?;
            Ok(FetchedPage {
                url: url.to_string(),
                bytes,
                content_type: Some("text/html; charset=UTF-8".to_string()),
            })
        }
    }
}
