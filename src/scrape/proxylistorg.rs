use async_trait::async_trait;
use tracing::debug;

use super::{build_client, parse_host_port_lines, Scraper};
use crate::config::ScraperConfig;
use crate::error::Result;
use crate::models::{Proxy, ProxyKind};

const FEEDS: &[&str] = &[
    "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
    "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
];

/// Raw `host:port` text mirrors; everything here is plain HTTP
pub struct ProxyListOrgScraper {
    client: reqwest::Client,
}

impl ProxyListOrgScraper {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }
}

#[async_trait]
impl Scraper for ProxyListOrgScraper {
    fn name(&self) -> &'static str {
        "proxylistorg"
    }

    async fn scrape(&self) -> Result<Vec<Proxy>> {
        let mut all = Vec::new();

        for url in FEEDS {
            let Ok(response) = self.client.get(*url).send().await else {
                continue;
            };
            if !response.status().is_success() {
                continue;
            }
            let Ok(text) = response.text().await else {
                continue;
            };

            let mut proxies = parse_host_port_lines(&text, ProxyKind::Http);
            debug!(url, count = proxies.len(), "proxylistorg feed parsed");
            all.append(&mut proxies);
        }

        Ok(all)
    }
}
