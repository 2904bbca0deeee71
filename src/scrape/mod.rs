//! Remote proxy-list sources and the deduplicating aggregator

mod freeproxylist;
mod geonode;
mod github;
mod proxylistorg;
mod proxyscrape;

pub use freeproxylist::FreeProxyListScraper;
pub use geonode::GeonodeScraper;
pub use github::GithubListScraper;
pub use proxylistorg::ProxyListOrgScraper;
pub use proxyscrape::ProxyScrapeScraper;

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ScraperConfig;
use crate::error::Result;
use crate::models::{Proxy, ProxyKind};

/// A single remote proxy-list source
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Stable identifier used in configuration
    fn name(&self) -> &'static str;

    /// Fetch and parse the source into proxy records
    async fn scrape(&self) -> Result<Vec<Proxy>>;
}

/// Per-source scrape tally
#[derive(Debug, Clone)]
pub struct SourceTally {
    pub source: &'static str,
    pub total: usize,
    pub unique: usize,
}

/// Aggregated scrape outcome: deduplicated proxies plus per-source counts
#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    pub proxies: Vec<Proxy>,
    pub per_source: Vec<SourceTally>,
}

/// Composes the configured source adapters
pub struct MultiScraper {
    scrapers: Vec<Box<dyn Scraper>>,
}

impl MultiScraper {
    /// Build from configuration; unknown names were rejected at config
    /// validation, an empty selection falls back to every adapter.
    pub fn from_config(config: &ScraperConfig) -> Self {
        let mut scrapers: Vec<Box<dyn Scraper>> = Vec::new();

        for source in &config.sources {
            match source.as_str() {
                "proxyscrape" => scrapers.push(Box::new(ProxyScrapeScraper::new(config))),
                "freeproxylist" => scrapers.push(Box::new(FreeProxyListScraper::new(config))),
                "geonode" => scrapers.push(Box::new(GeonodeScraper::new(config))),
                "proxylistorg" => scrapers.push(Box::new(ProxyListOrgScraper::new(config))),
                "github" => scrapers.push(Box::new(GithubListScraper::new(config))),
                other => warn!(source = other, "Skipping unknown scrape source"),
            }
        }

        if scrapers.is_empty() {
            scrapers = vec![
                Box::new(ProxyScrapeScraper::new(config)),
                Box::new(FreeProxyListScraper::new(config)),
                Box::new(GeonodeScraper::new(config)),
                Box::new(GithubListScraper::new(config)),
            ];
        }

        Self { scrapers }
    }

    /// For tests and embedding: compose explicit adapters
    pub fn with_scrapers(scrapers: Vec<Box<dyn Scraper>>) -> Self {
        Self { scrapers }
    }

    /// Invoke every adapter, deduplicate by `host:port` (first writer
    /// wins), and report per-source counts. A failing source is logged and
    /// skipped; an empty result is a valid outcome.
    pub async fn scrape_all(&self) -> ScrapeReport {
        let mut report = ScrapeReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for scraper in &self.scrapers {
            let proxies = match scraper.scrape().await {
                Ok(proxies) => proxies,
                Err(e) => {
                    warn!(source = scraper.name(), error = %e, "Scrape source failed");
                    continue;
                }
            };

            let total = proxies.len();
            let mut unique = 0;
            for proxy in proxies {
                if seen.insert(proxy.address()) {
                    report.proxies.push(proxy);
                    unique += 1;
                }
            }

            info!(
                source = scraper.name(),
                total, unique, "Scrape source finished"
            );
            report.per_source.push(SourceTally {
                source: scraper.name(),
                total,
                unique,
            });
        }

        info!(
            unique = report.proxies.len(),
            sources = report.per_source.len(),
            "Scrape cycle collected proxies"
        );
        report
    }
}

/// Shared reqwest client shape for the adapters
fn build_client(config: &ScraperConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .user_agent(config.user_agent.clone())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Parse `host:port` lines. Blank lines, `#` comments, and malformed
/// entries are skipped silently.
fn parse_host_port_lines(text: &str, kind: ProxyKind) -> Vec<Proxy> {
    let mut proxies = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((host, port)) = line.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        if host.is_empty() || port == 0 {
            continue;
        }

        proxies.push(Proxy::new(host, port, kind));
    }

    proxies
}

/// Parse `protocol://host:port` lines, skipping garbage as above
fn parse_protocol_lines(text: &str) -> Vec<Proxy> {
    let mut proxies = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((scheme, rest)) = line.split_once("://") else {
            continue;
        };
        let Some(kind) = ProxyKind::parse(scheme) else {
            continue;
        };
        let Some((host, port)) = rest.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        if host.is_empty() || port == 0 {
            continue;
        }

        proxies.push(Proxy::new(host, port, kind));
    }

    proxies
}
