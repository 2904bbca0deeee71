//! Rotation pool: in-memory cache of healthy upstreams plus the
//! background refresh machinery that keeps it warm.
//!
//! The cache is a projection of the store, not its authority. Failure
//! eviction is cache-only; each refresh cycle re-derives truth from
//! probes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, instrument, warn};

use crate::checker::CachedChecker;
use crate::config::Config;
use crate::database::Database;
use crate::error::{Result, VeilError};
use crate::models::{filter_healthy, PoolStats, Proxy};
use crate::repository::ProxyRepository;
use crate::scrape::MultiScraper;

/// Hard ceiling on one refresh cycle (scrape + probe + swap)
const REFRESH_BUDGET: Duration = Duration::from_secs(10 * 60);
/// Cadence of the store-to-cache rehydration loop
const REHYDRATE_INTERVAL: Duration = Duration::from_secs(60);
/// Cache size below which rehydration kicks in
const LOW_WATER: usize = 5;

/// Owns the healthy-proxy cache and serves rotation
pub struct PoolManager {
    scraper: MultiScraper,
    checker: CachedChecker,
    repo: ProxyRepository,

    cache: RwLock<Vec<Proxy>>,
    cursor: AtomicUsize,

    update_interval: Duration,
    max_age: Duration,
    background_enabled: bool,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(db: &Database, config: &Config) -> Arc<Self> {
        let repo = ProxyRepository::new(db.pool().clone());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            scraper: MultiScraper::from_config(&config.scraper),
            checker: CachedChecker::new(repo.clone(), &config.checker),
            repo,
            cache: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            update_interval: config.proxy.update_interval(),
            max_age: config.database.max_age(),
            background_enabled: config.checker.background_enabled,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the manager. Non-blocking when background refresh is enabled;
    /// otherwise performs one synchronous refresh and fails startup if it
    /// errors.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.load_healthy().await {
            warn!(error = %e, "Failed to load healthy proxies at startup");
        }

        info!(cached = self.healthy_count(), "Pool manager started");

        if self.background_enabled {
            if self.healthy_count() == 0 {
                info!("Cache empty, scheduling immediate refresh");
                let manager = self.clone();
                self.tasks.lock().push(tokio::spawn(async move {
                    manager.immediate_refresh().await;
                }));
            }

            let manager = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.tasks.lock().push(tokio::spawn(async move {
                manager.update_loop(shutdown).await;
            }));

            let manager = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.tasks.lock().push(tokio::spawn(async move {
                manager.rehydrate_loop(shutdown).await;
            }));
        } else {
            info!("Background refresh disabled, running one blocking refresh");
            self.refresh().await?;
        }

        Ok(())
    }

    /// Stop tickers and join every background task
    pub async fn stop(&self) {
        info!("Stopping pool manager");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        info!("Pool manager stopped");
    }

    /// One refresh cycle: scrape, probe with caching, swap the cache
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        let shutdown = self.shutdown_tx.subscribe();

        let results = tokio::time::timeout(REFRESH_BUDGET, async {
            let report = self.scraper.scrape_all().await;
            info!(scraped = report.proxies.len(), "Scrape finished, probing");
            self.checker.check_with_caching(report.proxies, &shutdown).await
        })
        .await
        .map_err(|_| VeilError::Timeout)?;

        let healthy = filter_healthy(&results);
        info!(
            healthy = healthy.len(),
            checked = results.len(),
            "Refresh probe pass finished"
        );

        let (old_count, new_count) = {
            let mut cache = self.cache.write();
            let old = cache.len();
            *cache = healthy;
            self.cursor.store(0, Ordering::Relaxed);
            (old, cache.len())
        };

        info!(old_count, new_count, "Swapped proxy cache");

        // Leaving the empty state: fold in proxies that are healthy in the
        // store but were not part of this probe pass, so they are not lost.
        if old_count == 0 && new_count > 0 {
            if let Err(e) = self.merge_store_healthy().await {
                warn!(error = %e, "Failed to merge stored healthy proxies");
            }
        }

        // Cleanup runs detached; its failure only costs disk space
        let repo = self.repo.clone();
        let max_age = self.max_age;
        tokio::spawn(async move {
            match repo.cleanup(max_age).await {
                Ok(removed) if removed > 0 => info!(removed, "Cleaned up stale proxy records"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Proxy cleanup failed"),
            }
        });

        Ok(())
    }

    /// Replace the cache with the store's healthy set
    async fn load_healthy(&self) -> Result<usize> {
        let records = self.repo.healthy_proxies().await?;
        let proxies: Vec<Proxy> = records.iter().map(|r| r.to_proxy()).collect();
        let count = proxies.len();

        let mut cache = self.cache.write();
        *cache = proxies;
        self.cursor.store(0, Ordering::Relaxed);

        info!(count, "Loaded healthy proxies from store");
        Ok(count)
    }

    /// Union the current cache with the store's healthy set
    async fn merge_store_healthy(&self) -> Result<()> {
        let records = self.repo.healthy_proxies().await?;

        let mut cache = self.cache.write();
        let mut seen: HashSet<String> = cache.iter().map(Proxy::address).collect();
        for record in &records {
            let proxy = record.to_proxy();
            if seen.insert(proxy.address()) {
                cache.push(proxy);
            }
        }

        info!(count = cache.len(), "Cache merged with stored healthy proxies");
        Ok(())
    }

    async fn immediate_refresh(self: Arc<Self>) {
        info!("Running immediate background refresh");
        if let Err(e) = self.refresh().await {
            error!(error = %e, "Immediate refresh failed");
            // Salvage whatever the store still considers healthy
            if let Err(e) = self.load_healthy().await {
                error!(error = %e, "Fallback load from store also failed");
            }
        }
    }

    async fn update_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.update_interval);
        ticker.tick().await; // the immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("Running scheduled proxy refresh");
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "Scheduled refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Every minute, reload from the store if the cache has drained below
    /// the low-water mark; adopt the reload only if it grew the cache.
    async fn rehydrate_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(REHYDRATE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = self.healthy_count();
                    if current >= LOW_WATER {
                        continue;
                    }

                    match self.repo.healthy_proxies().await {
                        Ok(records) => {
                            let proxies: Vec<Proxy> =
                                records.iter().map(|r| r.to_proxy()).collect();
                            let adopted = self.adopt_if_larger(proxies);
                            if adopted > current {
                                info!(from = current, to = adopted, "Cache rehydrated from store");
                            }
                        }
                        Err(e) => warn!(error = %e, "Cache rehydration failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Swap in `proxies` iff it is strictly larger; returns the cache size
    fn adopt_if_larger(&self, proxies: Vec<Proxy>) -> usize {
        let mut cache = self.cache.write();
        if proxies.len() > cache.len() {
            *cache = proxies;
            self.cursor.store(0, Ordering::Relaxed);
        }
        cache.len()
    }

    /// Round-robin selection. Two consecutive calls return distinct
    /// entries whenever the cache holds at least two proxies.
    pub fn next(&self) -> Result<Proxy> {
        let cache = self.cache.read();
        if cache.is_empty() {
            return Err(VeilError::NoProxyAvailable);
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % cache.len();
        Ok(cache[index].clone())
    }

    /// Uniform random selection
    pub fn random(&self) -> Result<Proxy> {
        let cache = self.cache.read();
        if cache.is_empty() {
            return Err(VeilError::NoProxyAvailable);
        }

        let index = rand::thread_rng().gen_range(0..cache.len());
        Ok(cache[index].clone())
    }

    /// Evict a failing proxy from the cache. The store is left alone; the
    /// next refresh reconciles.
    pub fn report_failure(&self, proxy: &Proxy) {
        let target = proxy.address();
        let mut cache = self.cache.write();

        let before = cache.len();
        cache.retain(|p| p.address() != target);

        if cache.len() < before {
            info!(address = %target, "Evicted failing proxy from cache");

            let len = cache.len();
            if len > 0 && self.cursor.load(Ordering::Relaxed) >= len {
                self.cursor.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Copy of the current cache, for the `/proxies` endpoint
    pub fn snapshot(&self) -> Vec<Proxy> {
        self.cache.read().clone()
    }

    pub fn stats(&self) -> PoolStats {
        let cache = self.cache.read();

        let mut stats = PoolStats {
            cached_proxies: cache.len(),
            cached_healthy: cache.len(),
            ..PoolStats::default()
        };

        for proxy in cache.iter() {
            *stats
                .proxy_kinds
                .entry(proxy.kind.as_str().to_string())
                .or_default() += 1;
            if let Some(country) = &proxy.country {
                *stats.proxy_countries.entry(country.clone()).or_default() += 1;
            }
        }

        stats
    }

    /// Store-level statistics, for the `/stats` endpoint
    pub async fn store_stats(&self) -> Result<crate::models::StoreStats> {
        self.repo.stats().await
    }

    #[cfg(test)]
    pub(crate) fn install_cache(&self, proxies: Vec<Proxy>) {
        let mut cache = self.cache.write();
        *cache = proxies;
        self.cursor.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckResult, ProxyKind, ProxyStatus};
    use chrono::Utc;

    async fn manager() -> Arc<PoolManager> {
        let db = Database::open_in_memory().await.unwrap();
        PoolManager::new(&db, &Config::default())
    }

    fn entries(n: u16) -> Vec<Proxy> {
        (0..n)
            .map(|i| Proxy::new(format!("10.0.0.{}", i + 1), 8080, ProxyKind::Http))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_cache_errors() {
        let manager = manager().await;

        assert!(matches!(manager.next(), Err(VeilError::NoProxyAvailable)));
        assert!(matches!(manager.random(), Err(VeilError::NoProxyAvailable)));
        assert_eq!(manager.healthy_count(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_visits_all_before_repeating() {
        let manager = manager().await;
        manager.install_cache(entries(3));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(manager.next().unwrap().address());
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);

        // Wraps back around in the same order
        assert_eq!(manager.next().unwrap().address(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_single_entry_always_returned() {
        let manager = manager().await;
        manager.install_cache(entries(1));

        for _ in 0..5 {
            assert_eq!(manager.next().unwrap().address(), "10.0.0.1:8080");
        }
    }

    #[tokio::test]
    async fn test_report_failure_evicts_exactly_once() {
        let manager = manager().await;
        manager.install_cache(entries(3));

        let victim = Proxy::new("10.0.0.2", 8080, ProxyKind::Http);
        manager.report_failure(&victim);
        assert_eq!(manager.healthy_count(), 2);

        // Evicting again is a no-op
        manager.report_failure(&victim);
        assert_eq!(manager.healthy_count(), 2);

        // Unknown proxies are a no-op too
        manager.report_failure(&Proxy::new("192.0.2.1", 1, ProxyKind::Http));
        assert_eq!(manager.healthy_count(), 2);
    }

    #[tokio::test]
    async fn test_rotation_after_eviction_cycles_survivors() {
        let manager = manager().await;
        manager.install_cache(entries(3));

        manager.report_failure(&Proxy::new("10.0.0.2", 8080, ProxyKind::Http));

        let a = manager.next().unwrap().address();
        let b = manager.next().unwrap().address();
        let c = manager.next().unwrap().address();
        let d = manager.next().unwrap().address();

        assert_eq!(a, "10.0.0.1:8080");
        assert_eq!(b, "10.0.0.3:8080");
        assert_eq!(c, "10.0.0.1:8080");
        assert_eq!(d, "10.0.0.3:8080");
    }

    #[tokio::test]
    async fn test_adopt_if_larger_only_grows() {
        let manager = manager().await;
        manager.install_cache(entries(3));

        assert_eq!(manager.adopt_if_larger(entries(2)), 3);
        assert_eq!(manager.healthy_count(), 3);

        assert_eq!(manager.adopt_if_larger(entries(6)), 6);
        assert_eq!(manager.healthy_count(), 6);
    }

    #[tokio::test]
    async fn test_stats_count_kinds_and_countries() {
        let manager = manager().await;

        let mut proxies = entries(2);
        proxies[0].kind = ProxyKind::Socks5;
        proxies[0].country = Some("US".to_string());
        proxies[1].country = Some("US".to_string());
        manager.install_cache(proxies);

        let stats = manager.stats();
        assert_eq!(stats.cached_proxies, 2);
        assert_eq!(stats.proxy_kinds.get("socks5"), Some(&1));
        assert_eq!(stats.proxy_kinds.get("http"), Some(&1));
        assert_eq!(stats.proxy_countries.get("US"), Some(&2));
    }

    #[tokio::test]
    async fn test_startup_loads_store_healthy_rows() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = ProxyRepository::new(db.pool().clone());

        for i in 0..4u16 {
            let proxy = Proxy::new(format!("10.1.0.{}", i + 1), 3128, ProxyKind::Http);
            let record = repo.upsert(&proxy).await.unwrap();
            repo.batch_update_health(&[(
                record.id,
                CheckResult {
                    proxy,
                    status: ProxyStatus::Healthy,
                    response_time: Duration::from_millis(10),
                    error: None,
                    checked_at: Utc::now(),
                },
            )])
            .await
            .unwrap();
        }

        let manager = PoolManager::new(&db, &Config::default());
        manager.load_healthy().await.unwrap();

        assert_eq!(manager.healthy_count(), 4);
        manager.next().unwrap();
    }
}
