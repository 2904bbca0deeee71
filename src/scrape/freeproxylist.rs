use async_trait::async_trait;
use tracing::debug;

use super::{build_client, parse_host_port_lines, Scraper};
use crate::config::ScraperConfig;
use crate::error::Result;
use crate::models::{Proxy, ProxyKind};

/// proxy-list.download API: one `host:port` per line, one feed per kind
pub struct FreeProxyListScraper {
    client: reqwest::Client,
}

const FEEDS: &[(&str, ProxyKind)] = &[
    (
        "https://www.proxy-list.download/api/v1/get?type=http",
        ProxyKind::Http,
    ),
    (
        "https://www.proxy-list.download/api/v1/get?type=https",
        ProxyKind::Https,
    ),
    (
        "https://www.proxy-list.download/api/v1/get?type=socks4",
        ProxyKind::Socks4,
    ),
    (
        "https://www.proxy-list.download/api/v1/get?type=socks5",
        ProxyKind::Socks5,
    ),
];

impl FreeProxyListScraper {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }

    async fn fetch_feed(&self, url: &str, kind: ProxyKind) -> Option<Vec<Proxy>> {
        let response = self.client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let text = response.text().await.ok()?;
        Some(parse_host_port_lines(&text, kind))
    }
}

#[async_trait]
impl Scraper for FreeProxyListScraper {
    fn name(&self) -> &'static str {
        "freeproxylist"
    }

    async fn scrape(&self) -> Result<Vec<Proxy>> {
        let mut all = Vec::new();

        // A dead feed for one kind must not sink the others
        for (url, kind) in FEEDS {
            if let Some(mut proxies) = self.fetch_feed(url, *kind).await {
                debug!(kind = %kind, count = proxies.len(), "freeproxylist feed parsed");
                all.append(&mut proxies);
            }
        }

        Ok(all)
    }
}
