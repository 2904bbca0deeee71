use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// Run all database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version, name, "Applying migration");

            sqlx::query(sql).execute(pool).await?;
            record_migration(pool, version, name).await?;
        }
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &SqlitePool, version: i32) -> Result<bool> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM schema_migrations WHERE version = ?")
            .bind(version)
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

/// Record a migration as applied
async fn record_migration(pool: &SqlitePool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// All migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "proxies_table", MIGRATION_001_PROXIES),
        (2, "probe_history_table", MIGRATION_002_PROBE_HISTORY),
    ]
}

// Migration 1: proxy records with health tracking
const MIGRATION_001_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    host             TEXT NOT NULL,
    port             INTEGER NOT NULL,
    kind             TEXT NOT NULL,
    country          TEXT,
    anonymity        TEXT,

    status           TEXT NOT NULL DEFAULT 'unknown',
    response_time_ms INTEGER,
    fail_count       INTEGER NOT NULL DEFAULT 0,

    first_seen_at    TEXT NOT NULL,
    last_checked_at  TEXT,
    last_healthy_at  TEXT,

    UNIQUE(host, port)
);

CREATE INDEX IF NOT EXISTS idx_proxies_host_port ON proxies(host, port);
CREATE INDEX IF NOT EXISTS idx_proxies_status ON proxies(status);
CREATE INDEX IF NOT EXISTS idx_proxies_last_checked ON proxies(last_checked_at);
CREATE INDEX IF NOT EXISTS idx_proxies_kind ON proxies(kind);
"#;

// Migration 2: per-probe audit rows
const MIGRATION_002_PROBE_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS probe_history (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    proxy_id         INTEGER NOT NULL,
    status           TEXT NOT NULL,
    response_time_ms INTEGER,
    error_message    TEXT,
    checked_at       TEXT NOT NULL,

    FOREIGN KEY (proxy_id) REFERENCES proxies (id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_probe_history_proxy_id ON probe_history(proxy_id);
CREATE INDEX IF NOT EXISTS idx_probe_history_checked_at ON probe_history(checked_at);
"#;
