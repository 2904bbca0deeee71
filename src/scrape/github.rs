use async_trait::async_trait;
use tracing::debug;

use super::{build_client, parse_protocol_lines, Scraper};
use crate::config::ScraperConfig;
use crate::error::{Result, VeilError};
use crate::models::Proxy;

const FEED_URL: &str =
    "https://raw.githubusercontent.com/proxifly/free-proxy-list/refs/heads/main/proxies/all/data.txt";

/// proxifly all-protocols list: `protocol://host:port` lines
pub struct GithubListScraper {
    client: reqwest::Client,
}

impl GithubListScraper {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }
}

#[async_trait]
impl Scraper for GithubListScraper {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn scrape(&self) -> Result<Vec<Proxy>> {
        let response = self.client.get(FEED_URL).send().await.map_err(|e| {
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
        debug!(count = proxies.len(), "github feed parsed");
        Ok(proxies)
    }
}
