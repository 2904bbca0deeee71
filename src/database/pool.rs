use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::error::{Result, VeilError};

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and initialize the schema.
    ///
    /// Failure here is fatal at startup.
    pub async fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_0755(parent)?;
            }
        }

        info!(path = %db_path, "Opening proxy store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| VeilError::DatabaseUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| VeilError::DatabaseUnavailable(e.to_string()))?;

        let db = Database { pool };
        db.run_migrations().await?;

        info!("Proxy store ready");
        Ok(db)
    }

    /// In-memory database for tests; single connection so every query
    /// sees the same store.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| VeilError::DatabaseUnavailable(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| VeilError::DatabaseUnavailable(e.to_string()))?;

        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run schema migrations (idempotent)
    pub async fn run_migrations(&self) -> Result<()> {
        super::migrations::run_migrations(&self.pool).await
    }

    /// Check connectivity
    pub async fn health_check(&self) -> Result<Duration> {
        let start = std::time::Instant::now();

        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(start.elapsed())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        info!("Closing proxy store");
        self.pool.close().await;
    }
}

#[cfg(unix)]
fn create_dir_0755(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_0755(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}
