use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::Checker;
use crate::config::CheckerConfig;
use crate::models::{CheckResult, Proxy, ProxyRecord};
use crate::repository::{chunk_updates, ProxyRepository};

const PERSIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache-aware checker: skips recently probed proxies, probes the rest in
/// sequential batches, and persists every finished batch.
pub struct CachedChecker {
    checker: Checker,
    repo: ProxyRepository,
    check_interval: Duration,
    batch_size: usize,
    batch_delay: Duration,
}

impl CachedChecker {
    pub fn new(repo: ProxyRepository, config: &CheckerConfig) -> Self {
        Self {
            checker: Checker::new(config),
            repo,
            check_interval: config.check_interval(),
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
        }
    }

    /// Classify the scraped set, honoring the freshness window.
    ///
    /// Proxies probed within `check_interval` are returned from the store
    /// verbatim; the rest are probed in batches of `batch_size` with
    /// `batch_delay` pauses. Cancellation stops the batch loop and returns
    /// whatever has been produced; records left unprobed fall back to their
    /// cached status.
    #[instrument(skip_all, fields(scraped = scraped.len()))]
    pub async fn check_with_caching(
        &self,
        scraped: Vec<Proxy>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<CheckResult> {
        if scraped.is_empty() {
            return Vec::new();
        }

        info!(
            count = scraped.len(),
            window_secs = self.check_interval.as_secs(),
            "Checking proxies with caching"
        );

        let addresses: Vec<String> = scraped.iter().map(|p| p.address()).collect();

        let mut known = match self.repo.get_by_addresses(&addresses).await {
            Ok(known) => known,
            Err(e) => {
                // Store trouble: fall back to probing everything, unpersisted
                warn!(error = %e, "Store lookup failed, probing the full set");
                return self.probe_in_batches(&scraped, shutdown, &HashMap::new()).await;
            }
        };

        debug!(existing = known.len(), "Found existing store records");

        // Upsert scraped proxies the store has never seen
        for proxy in &scraped {
            if known.contains_key(&proxy.address()) {
                continue;
            }
            match self.repo.upsert(proxy).await {
                Ok(record) => {
                    known.insert(record.address(), record);
                }
                Err(e) => {
                    warn!(address = %proxy.address(), error = %e, "Failed to upsert scraped proxy");
                }
            }
        }

        // Partition into fresh (cached verbatim) and stale/new (to probe)
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.check_interval).unwrap_or_default();

        let mut to_probe: Vec<Proxy> = Vec::new();
        let mut id_by_address: HashMap<String, i64> = HashMap::new();

        for record in known.values() {
            let is_stale = match record.last_checked_at {
                None => true,
                Some(checked_at) => checked_at < cutoff,
            };

            if is_stale {
                id_by_address.insert(record.address(), record.id);
                to_probe.push(record.to_proxy());
            }
        }

        info!(
            stale = to_probe.len(),
            total = known.len(),
            "Proxies needing a probe"
        );

        if to_probe.is_empty() {
            return known.values().map(ProxyRecord::cached_result).collect();
        }

        let probed = self.probe_in_batches(&to_probe, shutdown, &id_by_address).await;

        merge_results(&known, probed)
    }

    /// Probe sequentially in batches, persisting each batch as it lands.
    /// `id_by_address` maps probe targets to store ids; an empty map skips
    /// persistence (store-degraded mode).
    async fn probe_in_batches(
        &self,
        proxies: &[Proxy],
        shutdown: &watch::Receiver<bool>,
        id_by_address: &HashMap<String, i64>,
    ) -> Vec<CheckResult> {
        let total_batches = proxies.len().div_ceil(self.batch_size);
        let mut results: Vec<CheckResult> = Vec::with_capacity(proxies.len());
        let mut persist_tasks = Vec::new();

        info!(
            count = proxies.len(),
            batches = total_batches,
            batch_size = self.batch_size,
            delay_secs = self.batch_delay.as_secs(),
            "Probing in batches"
        );

        for (index, batch) in proxies.chunks(self.batch_size).enumerate() {
            if *shutdown.borrow() {
                info!(
                    done = index,
                    total = total_batches,
                    "Cancelled, returning partial probe results"
                );
                break;
            }

            let batch_results = self.checker.check_batch(batch, shutdown).await;

            if !batch_results.is_empty() && !id_by_address.is_empty() {
                let updates: Vec<(i64, CheckResult)> = batch_results
                    .iter()
                    .filter_map(|result| {
                        id_by_address
                            .get(&result.proxy.address())
                            .map(|id| (*id, result.clone()))
                    })
                    .collect();

                let repo = self.repo.clone();
                persist_tasks.push(tokio::spawn(async move {
                    persist_updates(repo, updates).await;
                }));
            }

            let healthy_so_far = results
                .iter()
                .chain(batch_results.iter())
                .filter(|r| r.is_healthy())
                .count();
            debug!(
                batch = index + 1,
                total = total_batches,
                healthy = healthy_so_far,
                "Batch complete"
            );

            results.extend(batch_results);

            // Pause between batches, except after the last one
            let last = (index + 1) * self.batch_size >= proxies.len();
            if !last {
                let mut shutdown = shutdown.clone();
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Cancelled during batch delay");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.batch_delay) => {}
                }
            }
        }

        // Results are only handed back once their store writes have settled
        for task in persist_tasks {
            let _ = task.await;
        }

        let healthy = results.iter().filter(|r| r.is_healthy()).count();
        info!(
            probed = results.len(),
            healthy, "Batch probing finished"
        );
        results
    }
}

/// Persist one batch of outcomes in store-sized chunks. A failed chunk is
/// logged and dropped; its records stay stale and are retried next cycle.
async fn persist_updates(repo: ProxyRepository, updates: Vec<(i64, CheckResult)>) {
    for chunk in chunk_updates(updates) {
        let count = chunk.len();
        match tokio::time::timeout(PERSIST_TIMEOUT, repo.batch_update_health(&chunk)).await {
            Ok(Ok(())) => debug!(count, "Persisted probe results"),
            Ok(Err(e)) => warn!(count, error = %e, "Failed to persist probe batch"),
            Err(_) => warn!(count, "Probe batch persist timed out"),
        }
    }
}

/// Fresh probe outcomes override cached rows; everything else is served
/// from the store verbatim.
fn merge_results(
    known: &HashMap<String, ProxyRecord>,
    probed: Vec<CheckResult>,
) -> Vec<CheckResult> {
    let mut by_address: HashMap<String, CheckResult> = probed
        .into_iter()
        .map(|r| (r.proxy.address(), r))
        .collect();

    let mut merged = Vec::with_capacity(known.len());
    for record in known.values() {
        match by_address.remove(&record.address()) {
            Some(fresh) => merged.push(fresh),
            None => merged.push(record.cached_result()),
        }
    }

    // Probed entries the store does not know (degraded lookups)
    merged.extend(by_address.into_values());
    merged
}
