use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                text TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                country TEXT NOT NULL,
                time_ms INTEGER,
                entities TEXT NOT NULL DEFAULT '[]', -- [{"name": .., "type": ..}]
                entity_ids TEXT NOT NULL DEFAULT '[]', -- normalized ids, used for filtering
                bucket TEXT, -- YYYYMMDDHH, written by the rollup
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_articles_bucket_time ON articles (bucket, time_ms);
            CREATE INDEX IF NOT EXISTS idx_articles_bucket_country_time ON articles (bucket, country, time_ms);

            -- Per-hour rollups. One row per counter cell.
            CREATE TABLE IF NOT EXISTS country_totals (
                bucket TEXT NOT NULL,
                country TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (bucket, country)
            );

            -- The autoincrement id records creation order, used to break ranking ties.
            CREATE TABLE IF NOT EXISTS entity_totals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE (bucket, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_entity_totals_rank ON entity_totals (bucket, total DESC, id);

            CREATE TABLE IF NOT EXISTS entity_country_counts (
                bucket TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                country TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (bucket, entity_id, country)
            );

            CREATE TABLE IF NOT EXISTS country_entity_counts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket TEXT NOT NULL,
                country TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE (bucket, country, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_country_entity_counts_rank ON country_entity_counts (bucket, country, count DESC, id);
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
