use sqlx::Row;
use std::collections::BTreeMap;
use tracing::instrument;

use super::core::Database;
use crate::error::Result;
use crate::model::{EntityCount, EntityType};
use crate::util::{entity_id, is_valid_bucket};

// SQLite treats a negative LIMIT as "no limit", so non-positive limits are cut short here.
fn positive_limit(limit: i64) -> Option<i64> {
    (limit > 0).then_some(limit)
}

impl Database {
    /// Number of articles per country (ISO3) in a bucket.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn country_totals(&self, bucket: &str) -> Result<BTreeMap<String, i64>> {
        let rows = self
            .timed(
                sqlx::query_as::<_, (String, i64)>(
                    "SELECT country, total FROM country_totals WHERE bucket = ?1 ORDER BY country",
                )
                .bind(bucket)
                .fetch_all(self.pool()),
            )
            .await?;

        Ok(rows.into_iter().collect())
    }

    /// Most mentioned entities of a bucket, highest count first.
    /// Ties fall back to creation order of the counter cell.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn top_entities(&self, bucket: &str, limit: i64) -> Result<Vec<EntityCount>> {
        let Some(limit) = positive_limit(limit) else {
            return Ok(Vec::new());
        };

        let rows = self
            .timed(
                sqlx::query(
                    r#"
                    SELECT entity_id, name, entity_type, total
                    FROM entity_totals
                    WHERE bucket = ?1
                    ORDER BY total DESC, id ASC
                    LIMIT ?2
                    "#,
                )
                .bind(bucket)
                .bind(limit)
                .fetch_all(self.pool()),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| EntityCount {
                entity_id: row.get("entity_id"),
                name: row.get("name"),
                entity_type: EntityType::from(row.get::<String, _>("entity_type")),
                count: row.get("total"),
            })
            .collect())
    }

    /// Most mentioned entities among one country's articles of a bucket.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn top_entities_for_country(
        &self,
        bucket: &str,
        country: &str,
        limit: i64,
    ) -> Result<Vec<EntityCount>> {
        let Some(limit) = positive_limit(limit) else {
            return Ok(Vec::new());
        };

        let rows = self
            .timed(
                sqlx::query(
                    r#"
                    SELECT entity_id, name, entity_type, count
                    FROM country_entity_counts
                    WHERE bucket = ?1 AND country = ?2 AND count > 0
                    ORDER BY count DESC, id ASC
                    LIMIT ?3
                    "#,
                )
                .bind(bucket)
                .bind(country)
                .bind(limit)
                .fetch_all(self.pool()),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| EntityCount {
                entity_id: row.get("entity_id"),
                name: row.get("name"),
                entity_type: EntityType::from(row.get::<String, _>("entity_type")),
                count: row.get("count"),
            })
            .collect())
    }

    /// Articles per country mentioning an entity, given by name or id.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn country_breakdown_for_entity(
        &self,
        bucket: &str,
        entity: &str,
    ) -> Result<BTreeMap<String, i64>> {
        let rows = self
            .timed(
                sqlx::query_as::<_, (String, i64)>(
                    r#"
                    SELECT country, count
                    FROM entity_country_counts
                    WHERE bucket = ?1 AND entity_id = ?2
                    ORDER BY country
                    "#,
                )
                .bind(bucket)
                .bind(entity_id(entity))
                .fetch_all(self.pool()),
            )
            .await?;

        Ok(rows.into_iter().collect())
    }

    pub async fn entity_total(&self, bucket: &str, entity: &str) -> Result<Option<EntityCount>> {
        let row = self
            .timed(
                sqlx::query(
                    r#"
                    SELECT entity_id, name, entity_type, total
                    FROM entity_totals
                    WHERE bucket = ?1 AND entity_id = ?2
                    "#,
                )
                .bind(bucket)
                .bind(entity_id(entity))
                .fetch_optional(self.pool()),
            )
            .await?;

        Ok(row.map(|row| EntityCount {
            entity_id: row.get("entity_id"),
            name: row.get("name"),
            entity_type: EntityType::from(row.get::<String, _>("entity_type")),
            count: row.get("total"),
        }))
    }

    /// Buckets that have at least one rolled-up article, oldest first.
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let buckets = self
            .timed(
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT bucket FROM country_totals ORDER BY bucket ASC",
                )
                .fetch_all(self.pool()),
            )
            .await?;

        Ok(buckets
            .into_iter()
            .filter(|bucket| is_valid_bucket(bucket))
            .collect())
    }
}
