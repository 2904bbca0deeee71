use async_trait::async_trait;
use tracing::debug;

use super::{build_client, parse_protocol_lines, Scraper};
use crate::config::ScraperConfig;
use crate::error::{Result, VeilError};
use crate::models::Proxy;

const API_URL: &str = "https://api.proxyscrape.com/v4/free-proxy-list/get\
?request=get_proxies&proxy_format=protocolipport&format=text";

/// ProxyScrape free-list API: one `protocol://host:port` per line
pub struct ProxyScrapeScraper {
    client: reqwest::Client,
}

impl ProxyScrapeScraper {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }
}

#[async_trait]
impl Scraper for ProxyScrapeScraper {
    fn name(&self) -> &'static str {
        "proxyscrape"
    }

    async fn scrape(&self) -> Result<Vec<Proxy>> {
        let response = self.client.get(API_URL).send().await.map_err(|e| {
            VeilError::ScrapeSourceFailed {
                source_name: self.name(),
                reason: e.to_string(),
            }
        })?;

        if !response.status().is_success() {
            return Err(VeilError::ScrapeSourceFailed {
                source_name: self.name(),
                reason: format!("HTTP {}", response.status().as_u16()),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| VeilError::ScrapeSourceFailed {
                source_name: self.name(),
                reason: e.to_string(),
            })?;

        let proxies = parse_protocol_lines(&text);
        debug!(count = proxies.len(), "proxyscrape feed parsed");
        Ok(proxies)
    }
}
