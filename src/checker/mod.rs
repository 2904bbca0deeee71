//! Upstream health probing
//!
//! Probe failures are data: every outcome maps to one of the non-healthy
//! statuses and feeds the store, never an `Err`.

mod cached;

pub use cached::CachedChecker;

use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::config::CheckerConfig;
use crate::models::{CheckResult, Proxy, ProxyStatus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes proxies by fetching a known URL through them
#[derive(Clone)]
pub struct Checker {
    test_url: String,
    timeout: Duration,
    max_workers: usize,
    user_agent: String,
}

impl Checker {
    pub fn new(config: &CheckerConfig) -> Self {
        Self {
            test_url: config.test_url.clone(),
            timeout: config.timeout(),
            max_workers: config.max_workers,
            user_agent: config.user_agent.clone(),
        }
    }

    /// Probe a single proxy and classify the outcome
    #[instrument(skip(self, proxy), fields(address = %proxy.address(), kind = %proxy.kind))]
    pub async fn check_proxy(&self, proxy: &Proxy) -> CheckResult {
        let start = Instant::now();
        let (status, error) = self.probe(proxy).await;

        let result = CheckResult {
            proxy: proxy.clone(),
            status,
            response_time: start.elapsed(),
            error,
            checked_at: Utc::now(),
        };

        debug!(status = %result.status, ms = result.response_time.as_millis() as u64, "Probe finished");
        result
    }

    /// Probe up to `max_workers` proxies concurrently. Workers observe the
    /// shutdown signal between probes; proxies not yet started when the
    /// signal fires are skipped.
    pub async fn check_batch(
        &self,
        proxies: &[Proxy],
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<CheckResult> {
        if proxies.is_empty() {
            return Vec::new();
        }

        let workers = self.max_workers.min(proxies.len()).max(1);

        futures::stream::iter(proxies.iter().cloned())
            .map(|proxy| {
                let shutdown = shutdown.clone();
                async move {
                    if *shutdown.borrow() {
                        return None;
                    }
                    Some(self.check_proxy(&proxy).await)
                }
            })
            .buffer_unordered(workers)
            .filter_map(|result| async move { result })
            .collect()
            .await
    }

    /// One GET of the test URL routed through the upstream. The client is
    /// built per probe: no connection reuse, no redirects, no TLS
    /// verification (free proxies rarely present a valid cert).
    async fn probe(&self, proxy: &Proxy) -> (ProxyStatus, Option<String>) {
        let upstream = match reqwest::Proxy::all(proxy.dial_url()) {
            Ok(upstream) => upstream,
            Err(e) => return (ProxyStatus::Error, Some(e.to_string())),
        };

        let client = match reqwest::Client::builder()
            .proxy(upstream)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .user_agent(self.user_agent.clone())
            .build()
        {
            Ok(client) => client,
            Err(e) => return (ProxyStatus::Error, Some(e.to_string())),
        };

        let response = client
            .get(&self.test_url)
            .header("Accept", "text/plain, application/json")
            .header("Connection", "close")
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => (ProxyStatus::Healthy, None),
            Ok(response) => (
                ProxyStatus::Unhealthy,
                Some(format!("HTTP {}", response.status().as_u16())),
            ),
            Err(e) => classify_probe_error(&e),
        }
    }
}

/// Map a transport error onto the probe status taxonomy
fn classify_probe_error(err: &reqwest::Error) -> (ProxyStatus, Option<String>) {
    let detail = error_chain(err);

    if err.is_timeout() {
        return (ProxyStatus::Timeout, Some(detail));
    }
    if is_connection_error(&detail) {
        return (ProxyStatus::Unhealthy, Some(detail));
    }

    (ProxyStatus::Error, Some(detail))
}

/// Flatten an error and its sources into one matchable string
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

fn is_connection_error(detail: &str) -> bool {
    let detail = detail.to_lowercase();
    detail.contains("connection refused")
        || detail.contains("no route to host")
        || detail.contains("network is unreachable")
        || detail.contains("connection reset")
}
