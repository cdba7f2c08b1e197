use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::Database;
use crate::cache::ArticleLoader;
use crate::error::{AtlasError, Result};
use crate::model::{dedup_entities, ArticleRecord, Event, EventEntity};
use crate::util::{article_id, entity_id, normalize_country};
use crate::TARGET_DB;

const ARTICLE_COLUMNS: &str =
    "id, title, text, url, country, time_ms, entities, entity_ids, bucket, processed";

fn article_from_row(row: &SqliteRow) -> Result<ArticleRecord> {
    let time_ms: Option<i64> = row.get("time_ms");
    let entities_json: String = row.get("entities");
    let entity_ids_json: String = row.get("entity_ids");
    let entities: Vec<EventEntity> = serde_json::from_str(&entities_json)?;
    let entity_ids: Vec<String> = serde_json::from_str(&entity_ids_json)?;

    Ok(ArticleRecord {
        id: row.get("id"),
        title: row.get("title"),
        text: row.get("text"),
        url: row.get("url"),
        country: row.get("country"),
        time: time_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        entities,
        entity_ids,
        bucket: row.get("bucket"),
        processed: row.get("processed"),
    })
}

impl Database {
    /// Stores an incoming event, returning its article id.
    ///
    /// Never touches `bucket` or `processed`. Once an article has been rolled up its
    /// row is frozen, so a redelivered event cannot drift away from the counters it
    /// already contributed to.
    #[instrument(target = "db", level = "info", skip(self, event), fields(title = %event.title))]
    pub async fn store_event(&self, event: &Event) -> Result<String> {
        let title = event.title.trim();
        if title.is_empty() {
            return Err(AtlasError::MalformedEvent("missing title".to_string()));
        }

        let id = match event.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => article_id(event.url.as_deref(), title, event.time.as_ref()).ok_or_else(|| {
                AtlasError::MalformedEvent(format!("no id, url or time for '{}'", title))
            })?,
        };

        let entities = dedup_entities(&event.entities);
        let entity_ids: Vec<String> = entities.iter().map(|e| entity_id(&e.name)).collect();
        let entities_json = serde_json::to_string(&entities)?;
        let entity_ids_json = serde_json::to_string(&entity_ids)?;
        let country = normalize_country(event.country.as_deref());
        let time_ms = event.time.map(|t| t.timestamp_millis());

        debug!(target: TARGET_DB, "Storing article {} ({} entities)", id, entities.len());

        self.timed(
            sqlx::query(
                r#"
                INSERT INTO articles (id, title, text, url, country, time_ms, entities, entity_ids)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    text = excluded.text,
                    url = excluded.url,
                    country = excluded.country,
                    time_ms = excluded.time_ms,
                    entities = excluded.entities,
                    entity_ids = excluded.entity_ids,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                WHERE articles.processed = 0
                "#,
            )
            .bind(&id)
            .bind(title)
            .bind(&event.text)
            .bind(event.url.as_deref().unwrap_or_default())
            .bind(&country)
            .bind(time_ms)
            .bind(&entities_json)
            .bind(&entity_ids_json)
            .execute(self.pool()),
        )
        .await?;

        Ok(id)
    }

    pub async fn get_article(&self, id: &str) -> Result<Option<ArticleRecord>> {
        let query = format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS);
        let row = self
            .timed(sqlx::query(&query).bind(id).fetch_optional(self.pool()))
            .await?;

        row.as_ref().map(article_from_row).transpose()
    }

    /// Most recent rolled-up articles of a bucket, optionally narrowed to a country
    /// and/or an entity. The entity matches either its normalized id or the raw string.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn load_articles(
        &self,
        bucket: &str,
        country: Option<&str>,
        entity: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArticleRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut query = format!("SELECT {} FROM articles WHERE bucket = ?", ARTICLE_COLUMNS);
        if country.is_some() {
            query.push_str(" AND country = ?");
        }
        if entity.is_some() {
            query.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(articles.entity_ids) WHERE json_each.value IN (?, ?))",
            );
        }
        query.push_str(" ORDER BY time_ms DESC, id ASC LIMIT ?");

        let mut query_builder = sqlx::query(&query).bind(bucket);
        if let Some(country) = country {
            query_builder = query_builder.bind(country);
        }
        if let Some(entity) = entity {
            query_builder = query_builder.bind(entity_id(entity)).bind(entity);
        }
        query_builder = query_builder.bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = self.timed(query_builder.fetch_all(self.pool())).await?;
        debug!(target: TARGET_DB, "Loaded {} articles for bucket {}", rows.len(), bucket);

        rows.iter().map(article_from_row).collect()
    }
}

#[async_trait]
impl ArticleLoader for Database {
    async fn fetch(
        &self,
        bucket: &str,
        country: Option<&str>,
        entity: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArticleRecord>> {
        self.load_articles(bucket, country, entity, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use chrono::DateTime;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 1, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let db = Database::in_memory().await.unwrap();
        let event = Event::new("Launch window opens", Some("usa"), at(5))
            .with_entity("NASA", EntityType::Organization)
            .with_entity("nasa", EntityType::Other)
            .with_entity("Cape Canaveral", EntityType::Location);

        let id = db.store_event(&event).await.unwrap();
        let stored = db.get_article(&id).await.unwrap().unwrap();

        assert_eq!(stored.country, "USA");
        assert_eq!(stored.time, Some(at(5)));
        assert_eq!(stored.entity_ids, vec!["nasa", "cape-canaveral"]);
        assert_eq!(stored.entities[0].entity_type, EntityType::Organization);
        assert_eq!(stored.bucket, None);
        assert!(!stored.processed);
    }

    #[tokio::test]
    async fn test_store_without_country_uses_sentinel() {
        let db = Database::in_memory().await.unwrap();
        let id = db
            .store_event(&Event::new("Somewhere", None, at(1)).with_id("e-1"))
            .await
            .unwrap();
        assert_eq!(id, "e-1");
        let stored = db.get_article(&id).await.unwrap().unwrap();
        assert_eq!(stored.country, crate::util::UNKNOWN_COUNTRY);
    }

    #[tokio::test]
    async fn test_store_rejects_malformed_events() {
        let db = Database::in_memory().await.unwrap();

        let untitled = Event::new("  ", Some("USA"), at(1));
        assert!(matches!(
            db.store_event(&untitled).await,
            Err(AtlasError::MalformedEvent(_))
        ));

        let unanchored = Event {
            title: "No time, no url, no id".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            db.store_event(&unanchored).await,
            Err(AtlasError::MalformedEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_article_is_none() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.get_article("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unprocessed_articles_are_not_listed() {
        let db = Database::in_memory().await.unwrap();
        db.store_event(&Event::new("Pending", Some("USA"), at(1)))
            .await
            .unwrap();
        let rows = db
            .load_articles("2025110110", None, None, 10)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
