use chrono::{TimeZone, Utc};
use rand::Rng;
use sqlx::{Row, Sqlite, Transaction};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, instrument, warn};

use super::core::Database;
use crate::error::{AtlasError, Result};
use crate::model::{dedup_entities, EventEntity};
use crate::util::{hour_bucket, normalize_country};
use crate::TARGET_ROLLUP;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_JITTER_MS: u64 = 200;

impl Database {
    /// Adds one article to the hourly rollups, exactly once.
    ///
    /// The `processed` marker, the bucket and every counter increment commit in a
    /// single transaction. An article that is already processed is a no-op.
    /// A lost write race surfaces as [`AtlasError::RetryableConflict`]; re-running
    /// is safe.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn apply_event(&self, article_id: &str) -> Result<()> {
        self.timed(self.apply_event_txn(article_id)).await
    }

    async fn apply_event_txn(&self, article_id: &str) -> Result<()> {
        // Take the write lock up front. A deferred transaction would read under a
        // snapshot and then fail to upgrade once any other rollup had committed;
        // IMMEDIATE makes concurrent rollups queue on the busy timeout instead.
        let mut transaction = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let row = sqlx::query(
            r#"
            SELECT country, time_ms, entities, bucket, processed
            FROM articles
            WHERE id = ?1
            "#,
        )
        .bind(article_id)
        .fetch_optional(&mut *transaction)
        .await?;

        let Some(row) = row else {
            transaction.rollback().await?;
            return Err(AtlasError::EventNotFound(article_id.to_string()));
        };

        let processed: bool = row.get("processed");
        if processed {
            debug!(target: TARGET_ROLLUP, "Article {} already rolled up, skipping", article_id);
            transaction.rollback().await?;
            return Ok(());
        }

        let stored_bucket: Option<String> = row.get("bucket");
        let time_ms: Option<i64> = row.get("time_ms");
        let bucket = match stored_bucket {
            Some(bucket) => bucket,
            None => match time_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
                Some(time) => hour_bucket(&time),
                None => {
                    transaction.rollback().await?;
                    return Err(AtlasError::MalformedEvent(format!(
                        "article {} has no timestamp",
                        article_id
                    )));
                }
            },
        };
        let country_raw: String = row.get("country");
        let country = normalize_country(Some(&country_raw));
        let entities_json: String = row.get("entities");
        let entities: Vec<EventEntity> = serde_json::from_str(&entities_json)?;
        let entities = dedup_entities(&entities);

        // Conditional on the marker still being clear, so two racing rollups of the
        // same article cannot both get past this point.
        let marked = sqlx::query(
            r#"
            UPDATE articles
            SET processed = 1,
                bucket = ?1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?2 AND processed = 0
            "#,
        )
        .bind(&bucket)
        .bind(article_id)
        .execute(&mut *transaction)
        .await?;

        if marked.rows_affected() == 0 {
            debug!(target: TARGET_ROLLUP, "Article {} was claimed by another rollup", article_id);
            transaction.rollback().await?;
            return Ok(());
        }

        increment_country_total(&mut transaction, &bucket, &country).await?;
        for entity in &entities {
            increment_entity(&mut transaction, &bucket, &country, entity).await?;
        }

        transaction.commit().await?;

        info!(
            target: TARGET_ROLLUP,
            "Rolled up article {} into bucket {} ({}, {} entities)",
            article_id,
            bucket,
            country,
            entities.len()
        );
        Ok(())
    }

    /// [`Database::apply_event`], retried with exponential backoff while it keeps
    /// conflicting. Any other error is returned immediately.
    pub async fn apply_event_with_retry(&self, article_id: &str, max_attempts: u32) -> Result<()> {
        let max_attempts = max_attempts.max(1);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 1..=max_attempts {
            match self.apply_event(article_id).await {
                Err(AtlasError::RetryableConflict) if attempt < max_attempts => {
                    // Randomness avoids the "thundering herd problem"
                    let jitter = rand::rng().random_range(0..MAX_JITTER_MS);
                    info!(
                        target: TARGET_ROLLUP,
                        "Rollup of {} conflicted, waiting {}ms before retrying attempt {}/{}",
                        article_id,
                        backoff + jitter,
                        attempt + 1,
                        max_attempts
                    );
                    sleep(Duration::from_millis(backoff + jitter)).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(AtlasError::RetryableConflict) => {
                    warn!(target: TARGET_ROLLUP, "Giving up on rollup of {} after {} attempts", article_id, max_attempts);
                    return Err(AtlasError::RetryableConflict);
                }
                other => return other,
            }
        }

        Err(AtlasError::RetryableConflict)
    }
}

async fn increment_country_total(
    transaction: &mut Transaction<'_, Sqlite>,
    bucket: &str,
    country: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO country_totals (bucket, country, total)
        VALUES (?1, ?2, 1)
        ON CONFLICT(bucket, country) DO UPDATE SET
            total = total + 1,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .bind(bucket)
    .bind(country)
    .execute(&mut **transaction)
    .await?;
    Ok(())
}

// The display name and type of a cell are fixed by the first article that creates it.
async fn increment_entity(
    transaction: &mut Transaction<'_, Sqlite>,
    bucket: &str,
    country: &str,
    entity: &EventEntity,
) -> Result<()> {
    let entity_id = entity.id();
    let entity_type = entity.entity_type.to_string();

    sqlx::query(
        r#"
        INSERT INTO entity_totals (bucket, entity_id, name, entity_type, total)
        VALUES (?1, ?2, ?3, ?4, 1)
        ON CONFLICT(bucket, entity_id) DO UPDATE SET
            total = total + 1,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .bind(bucket)
    .bind(&entity_id)
    .bind(&entity.name)
    .bind(&entity_type)
    .execute(&mut **transaction)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO entity_country_counts (bucket, entity_id, country, count)
        VALUES (?1, ?2, ?3, 1)
        ON CONFLICT(bucket, entity_id, country) DO UPDATE SET
            count = count + 1,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .bind(bucket)
    .bind(&entity_id)
    .bind(country)
    .execute(&mut **transaction)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO country_entity_counts (bucket, country, entity_id, name, entity_type, count)
        VALUES (?1, ?2, ?3, ?4, ?5, 1)
        ON CONFLICT(bucket, country, entity_id) DO UPDATE SET
            count = count + 1,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .bind(bucket)
    .bind(country)
    .bind(&entity_id)
    .bind(&entity.name)
    .bind(&entity_type)
    .execute(&mut **transaction)
    .await?;

    Ok(())
}
