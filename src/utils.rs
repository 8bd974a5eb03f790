use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

/// User agents rotated across requests
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

pub fn get_random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    USER_AGENTS[rng.random_range(0..USER_AGENTS.len())]
}

/// Fixed pause between successive page fetches. Not adaptive.
#[derive(Debug, Clone, Copy)]
pub struct PageDelay {
    delay_ms: u64,
}

impl PageDelay {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub async fn wait(&self) {
        sleep(Duration::from_millis(self.delay_ms)).await;
    }
}

impl Default for PageDelay {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Resolves `href` against `base`; only http(s) results are accepted.
pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let url = Url::parse(base).ok()?.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Lower-cased top-level domain of `url`, used as an encoding hint.
pub fn tld_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    host.rsplit('.').next().map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_user_agent() {
        let agent = get_random_user_agent();
        assert!(USER_AGENTS.contains(&agent));
    }

    #[test]
    fn test_page_delay() {
        assert_eq!(PageDelay::new(250).delay_ms(), 250);
        assert_eq!(PageDelay::default().delay_ms(), 1000);
    }

    #[test]
    fn test_absolute_url() {
        assert_eq!(
            absolute_url("https://www.carsensor.net/usedcar/index2.html", "/usedcar/index3.html"),
            Some("https://www.carsensor.net/usedcar/index3.html".to_string())
        );
        assert_eq!(
            absolute_url("https://www.goo-net.com/a/b.html", "c.html"),
            Some("https://www.goo-net.com/a/c.html".to_string())
        );
        assert_eq!(absolute_url("https://www.goo-net.com/", "javascript:void(0)"), None);
        assert_eq!(absolute_url("not a url", "/x"), None);
    }

    #[test]
    fn test_tld_of() {
        assert_eq!(tld_of("https://www.goo-net.com/usedcar/"), Some("com".to_string()));
        assert_eq!(tld_of("http://example.co.jp"), Some("jp".to_string()));
    }
}
