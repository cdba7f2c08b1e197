use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::{AtlasConfig, DEFAULT_STORE_TIMEOUT_MS};
use crate::error::{AtlasError, Result};
use crate::TARGET_DB;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    timeout: Duration,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Upper bound applied to every store call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(target = "db", level = "info")]
    pub async fn new(database_path: &str, max_connections: u32, timeout: Duration) -> Result<Self> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_path);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        let db = Database { pool, timeout };
        db.initialize_schema().await?;

        Ok(db)
    }

    pub async fn from_config(config: &AtlasConfig) -> Result<Self> {
        Self::new(
            &config.database_path,
            config.max_connections,
            config.store_timeout,
        )
        .await
    }

    /// Private in-memory database on a single connection that never recycles
    /// (an in-memory SQLite database lives only as long as its connection).
    pub async fn in_memory() -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let db = Database {
            pool,
            timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Runs a store call under the configured timeout. A call that times out is
    /// dropped, which rolls back any transaction it had open.
    pub(crate) async fn timed<T, E, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<AtlasError>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(AtlasError::Timeout(self.timeout)),
        }
    }
}
