use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::Result;
use crate::models::{CheckResult, Proxy, ProxyRecord, StoreStats};

/// Upper bound on records per health-update transaction. Callers chunk
/// larger result sets so no transaction holds the writer for long.
pub const MAX_UPDATE_BATCH: usize = 50;

const RECORD_COLUMNS: &str = "id, host, port, kind, country, anonymity, status, \
     response_time_ms, fail_count, first_seen_at, last_checked_at, last_healthy_at";

/// Repository for proxy store operations
#[derive(Clone)]
pub struct ProxyRepository {
    pool: SqlitePool,
}

impl ProxyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a scraped proxy, or refresh its kind/country metadata if the
    /// address already exists. Health columns and timestamps of an existing
    /// row are never touched, so rescraping cannot reset cached health.
    pub async fn upsert(&self, proxy: &Proxy) -> Result<ProxyRecord> {
        let record = sqlx::query_as::<_, ProxyRecord>(&format!(
            r#"
            INSERT INTO proxies (host, port, kind, country, first_seen_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(host, port) DO UPDATE SET
                kind = excluded.kind,
                country = COALESCE(excluded.country, proxies.country)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&proxy.host)
        .bind(proxy.port)
        .bind(proxy.kind.as_str())
        .bind(&proxy.country)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Fetch a single record by its address components
    pub async fn get_by_host_port(&self, host: &str, port: u16) -> Result<Option<ProxyRecord>> {
        let record = sqlx::query_as::<_, ProxyRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM proxies WHERE host = ? AND port = ?"
        ))
        .bind(host)
        .bind(port)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Bulk lookup keyed by `host:port`; one round trip
    pub async fn get_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<HashMap<String, ProxyRecord>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM proxies WHERE (host || ':' || port) IN ("
        ));

        let mut separated = query.separated(", ");
        for address in addresses {
            separated.push_bind(address);
        }
        query.push(")");

        let records: Vec<ProxyRecord> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(records
            .into_iter()
            .map(|r| (r.address(), r))
            .collect())
    }

    /// Records whose last probe is missing or older than `interval`
    pub async fn needing_check(&self, interval: Duration) -> Result<Vec<ProxyRecord>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(interval).unwrap_or_default();

        let records = sqlx::query_as::<_, ProxyRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM proxies
            WHERE last_checked_at IS NULL OR last_checked_at < ?
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Apply a set of probe outcomes in a single transaction.
    ///
    /// A healthy outcome sets both timestamps and zeroes `fail_count`; any
    /// other outcome advances only `last_checked_at` and increments
    /// `fail_count`. Callers chunk input at [`MAX_UPDATE_BATCH`]. Audit
    /// rows are appended after the commit, best-effort: a history insert
    /// failure never fails the batch.
    pub async fn batch_update_health(&self, updates: &[(i64, CheckResult)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for (id, result) in updates {
            let response_ms = result.response_time.as_millis() as i64;

            if result.is_healthy() {
                sqlx::query(
                    r#"
                    UPDATE proxies
                    SET status = ?, last_checked_at = ?, response_time_ms = ?,
                        last_healthy_at = ?, fail_count = 0
                    WHERE id = ?
                    "#,
                )
                .bind(result.status.as_str())
                .bind(now)
                .bind(response_ms)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE proxies
                    SET status = ?, last_checked_at = ?, response_time_ms = ?,
                        fail_count = fail_count + 1
                    WHERE id = ?
                    "#,
                )
                .bind(result.status.as_str())
                .bind(now)
                .bind(response_ms)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        self.append_probe_history(updates).await;

        debug!(count = updates.len(), "Batch updated proxy health records");
        Ok(())
    }

    /// Audit trail behind the committed health rows. Failures only cost
    /// history, so they are logged and dropped.
    async fn append_probe_history(&self, updates: &[(i64, CheckResult)]) {
        for (id, result) in updates {
            let insert = sqlx::query(
                r#"
                INSERT INTO probe_history (proxy_id, status, response_time_ms, error_message, checked_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(result.status.as_str())
            .bind(result.response_time.as_millis() as i64)
            .bind(&result.error)
            .bind(result.checked_at)
            .execute(&self.pool)
            .await;

            if let Err(e) = insert {
                debug!(proxy_id = id, error = %e, "Failed to record probe history");
            }
        }
    }

    /// All healthy records, most recently healthy first
    pub async fn healthy_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let records = sqlx::query_as::<_, ProxyRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM proxies
            WHERE status = 'healthy'
            ORDER BY last_healthy_at DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Delete records never seen healthy, or not healthy within `max_age`.
    /// Returns the number of rows removed.
    pub async fn cleanup(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        let result =
            sqlx::query("DELETE FROM proxies WHERE last_healthy_at IS NULL OR last_healthy_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Store-wide statistics
    pub async fn stats(&self) -> Result<StoreStats> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;

        let healthy =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proxies WHERE status = 'healthy'")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT kind, COUNT(*) FROM proxies GROUP BY kind",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(StoreStats {
            total,
            healthy,
            by_kind: rows.into_iter().collect(),
        })
    }
}

/// Split probe outcomes into store-sized update chunks
pub fn chunk_updates(updates: Vec<(i64, CheckResult)>) -> Vec<Vec<(i64, CheckResult)>> {
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(MAX_UPDATE_BATCH.min(updates.len()));

    for update in updates {
        current.push(update);
        if current.len() == MAX_UPDATE_BATCH {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
