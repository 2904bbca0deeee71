use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{build_client, Scraper};
use crate::config::ScraperConfig;
use crate::error::{Result, VeilError};
use crate::models::{Proxy, ProxyKind};

const API_URL: &str = "https://proxylist.geonode.com/api/proxy-list?limit=500";

/// Geonode JSON API; the one source that carries country metadata
pub struct GeonodeScraper {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GeonodeResponse {
    data: Vec<GeonodeProxy>,
}

#[derive(Debug, Deserialize)]
struct GeonodeProxy {
    ip: String,
    port: String,
    protocols: Vec<String>,
    #[serde(default)]
    country: Option<String>,
}

impl GeonodeScraper {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }

    fn parse(response: GeonodeResponse) -> Vec<Proxy> {
        let mut proxies = Vec::new();

        for entry in response.data {
            let Ok(port) = entry.port.parse::<u16>() else {
                continue;
            };
            if port == 0 {
                continue;
            }

            // One record per advertised protocol
            for protocol in &entry.protocols {
                let Some(kind) = ProxyKind::parse(protocol) else {
                    continue;
                };
                let mut proxy = Proxy::new(entry.ip.clone(), port, kind);
                proxy.country = entry.country.clone().filter(|c| !c.is_empty());
                proxies.push(proxy);
            }
        }

        proxies
    }
}

#[async_trait]
impl Scraper for GeonodeScraper {
    fn name(&self) -> &'static str {
        "geonode"
    }

    async fn scrape(&self) -> Result<Vec<Proxy>> {
        let response = self
            .client
            .get(API_URL)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| VeilError::ScrapeSourceFailed {
                source_name: self.name(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(VeilError::ScrapeSourceFailed {
                source_name: self.name(),
                reason: format!("HTTP {}", response.status().as_u16()),
            });
        }

        let body: GeonodeResponse =
            response
                .json()
                .await
                .map_err(|e| VeilError::ScrapeSourceFailed {
                    source_name: self.name(),
                    reason: format!("bad JSON: {e}"),
                })?;

        let proxies = Self::parse(body);
        debug!(count = proxies.len(), "geonode feed parsed");
        Ok(proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expands_protocols_and_skips_garbage() {
        let body: GeonodeResponse = serde_json::from_str(
            r#"{
                "data": [
                    {"ip": "1.2.3.4", "port": "8080", "protocols": ["http", "https"], "country": "DE"},
                    {"ip": "5.6.7.8", "port": "1080", "protocols": ["socks5"], "country": ""},
                    {"ip": "9.9.9.9", "port": "banana", "protocols": ["http"]},
                    {"ip": "8.8.8.8", "port": "3128", "protocols": ["carrier-pigeon"]}
                ]
            }"#,
        )
        .unwrap();

        let proxies = GeonodeScraper::parse(body);
        assert_eq!(proxies.len(), 3);
        assert_eq!(proxies[0].kind, ProxyKind::Http);
        assert_eq!(proxies[0].country.as_deref(), Some("DE"));
        assert_eq!(proxies[1].kind, ProxyKind::Https);
        assert_eq!(proxies[2].kind, ProxyKind::Socks5);
        assert!(proxies[2].country.is_none());
    }
}
