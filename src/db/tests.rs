use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

use super::Database;
use crate::error::AtlasError;
use crate::model::{EntityType, Event};

const BUCKET: &str = "2025110110";

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 1, 10, minute, 0).unwrap()
}

async fn ingest(db: &Database, event: Event) -> String {
    let id = db.store_event(&event).await.unwrap();
    db.apply_event(&id).await.unwrap();
    id
}

async fn scenario_a(db: &Database) -> (String, String) {
    let first = ingest(
        db,
        Event::new("NASA budget", Some("USA"), at(5))
            .with_entity("NASA", EntityType::Organization),
    )
    .await;
    let second = ingest(
        db,
        Event::new("Launch cleared", Some("USA"), at(20))
            .with_entity("NASA", EntityType::Organization)
            .with_entity("FAA", EntityType::Organization),
    )
    .await;
    (first, second)
}

/// Every counter cell of a bucket, for comparing whole states.
async fn counter_state(db: &Database) -> Vec<(String, i64)> {
    let mut state = Vec::new();
    for (country, total) in db.country_totals(BUCKET).await.unwrap() {
        state.push((format!("country/{}", country), total));
    }
    for entity in db.top_entities(BUCKET, 1000).await.unwrap() {
        state.push((format!("entity/{}", entity.entity_id), entity.count));
        for (country, count) in db
            .country_breakdown_for_entity(BUCKET, &entity.entity_id)
            .await
            .unwrap()
        {
            state.push((format!("entity/{}/{}", entity.entity_id, country), count));
        }
    }
    for country in db.country_totals(BUCKET).await.unwrap().keys() {
        for entity in db
            .top_entities_for_country(BUCKET, country, 1000)
            .await
            .unwrap()
        {
            state.push((format!("country/{}/{}", country, entity.entity_id), entity.count));
        }
    }
    state.sort();
    state
}

#[tokio::test]
async fn test_scenario_two_usa_events() {
    let db = Database::in_memory().await.unwrap();
    scenario_a(&db).await;

    let totals = db.country_totals(BUCKET).await.unwrap();
    assert_eq!(totals.get("USA"), Some(&2));

    let nasa = db.entity_total(BUCKET, "nasa").await.unwrap().unwrap();
    assert_eq!(nasa.count, 2);
    assert_eq!(nasa.name, "NASA");
    assert_eq!(nasa.entity_type, EntityType::Organization);

    let nasa_by_country = db.country_breakdown_for_entity(BUCKET, "nasa").await.unwrap();
    assert_eq!(nasa_by_country.get("USA"), Some(&2));
    let faa_by_country = db.country_breakdown_for_entity(BUCKET, "FAA").await.unwrap();
    assert_eq!(faa_by_country.get("USA"), Some(&1));
}

#[tokio::test]
async fn test_apply_marks_article_and_sets_bucket() {
    let db = Database::in_memory().await.unwrap();
    let (first, _) = scenario_a(&db).await;
    let stored = db.get_article(&first).await.unwrap().unwrap();
    assert!(stored.processed);
    assert_eq!(stored.bucket.as_deref(), Some(BUCKET));
}

#[tokio::test]
async fn test_reapplying_is_a_no_op() {
    let db = Database::in_memory().await.unwrap();
    let (first, second) = scenario_a(&db).await;
    let before = counter_state(&db).await;

    db.apply_event(&first).await.unwrap();
    db.apply_event(&second).await.unwrap();
    db.apply_event(&second).await.unwrap();

    assert_eq!(counter_state(&db).await, before);
}

#[tokio::test]
async fn test_redelivered_event_does_not_recount() {
    let db = Database::in_memory().await.unwrap();
    let event = Event::new("Quake", Some("JPN"), at(3))
        .with_id("quake-1")
        .with_entity("Tokyo", EntityType::Location);
    ingest(&db, event.clone()).await;
    let before = counter_state(&db).await;

    // at-least-once delivery: the same event arrives again, even with edits
    let edited = Event {
        country: Some("KOR".to_string()),
        ..event
    };
    let id = db.store_event(&edited).await.unwrap();
    db.apply_event(&id).await.unwrap();

    assert_eq!(counter_state(&db).await, before);
    let stored = db.get_article("quake-1").await.unwrap().unwrap();
    assert_eq!(stored.country, "JPN");
}

#[tokio::test]
async fn test_breakdowns_sum_to_entity_totals() {
    let db = Database::in_memory().await.unwrap();
    let events = [
        ("a", Some("USA"), vec!["NASA", "FAA"]),
        ("b", Some("FRA"), vec!["NASA", "ESA"]),
        ("c", None, vec!["ESA"]),
        ("d", Some("USA"), vec!["SpaceX", "NASA", "nasa"]),
        ("e", Some("DEU"), vec!["ESA", "SpaceX"]),
    ];
    for (i, (title, country, entities)) in events.iter().enumerate() {
        let mut event = Event::new(title, *country, at(i as u32));
        for name in entities {
            event = event.with_entity(name, EntityType::Organization);
        }
        ingest(&db, event).await;
    }

    let top = db.top_entities(BUCKET, 100).await.unwrap();
    assert_eq!(top.len(), 4);
    for entity in top {
        let breakdown = db
            .country_breakdown_for_entity(BUCKET, &entity.entity_id)
            .await
            .unwrap();
        assert_eq!(breakdown.values().sum::<i64>(), entity.count, "{}", entity.name);
    }
}

#[tokio::test]
async fn test_country_entity_fan_out() {
    let db = Database::in_memory().await.unwrap();
    scenario_a(&db).await;

    let totals = db.country_totals(BUCKET).await.unwrap();
    let per_entity = db.top_entities_for_country(BUCKET, "USA", 10).await.unwrap();

    // one event, two entities: the per-entity cells add up to more than the events
    assert_eq!(totals["USA"], 2);
    assert_eq!(per_entity.iter().map(|e| e.count).sum::<i64>(), 3);
    assert_eq!(per_entity[0].name, "NASA");
    assert_eq!(per_entity[0].count, 2);
}

#[tokio::test]
async fn test_duplicate_entities_in_one_event_count_once() {
    let db = Database::in_memory().await.unwrap();
    ingest(
        &db,
        Event::new("Echo", Some("GBR"), at(1))
            .with_entity("BBC", EntityType::Organization)
            .with_entity("bbc", EntityType::Organization)
            .with_entity("B.B.C", EntityType::Organization),
    )
    .await;

    let bbc = db.entity_total(BUCKET, "BBC").await.unwrap().unwrap();
    assert_eq!(bbc.count, 1);
}

#[tokio::test]
async fn test_missing_country_rolls_up_as_unknown() {
    let db = Database::in_memory().await.unwrap();
    ingest(
        &db,
        Event::new("Stateless", None, at(1)).with_entity("UN", EntityType::Organization),
    )
    .await;

    let totals = db.country_totals(BUCKET).await.unwrap();
    assert_eq!(totals, BTreeMap::from([("XX".to_string(), 1)]));
    let breakdown = db.country_breakdown_for_entity(BUCKET, "UN").await.unwrap();
    assert_eq!(breakdown.get("XX"), Some(&1));
}

#[tokio::test]
async fn test_events_land_in_their_own_hour() {
    let db = Database::in_memory().await.unwrap();
    ingest(&db, Event::new("Early", Some("USA"), at(59))).await;
    ingest(
        &db,
        Event::new(
            "Late",
            Some("USA"),
            Utc.with_ymd_and_hms(2025, 11, 1, 11, 0, 0).unwrap(),
        ),
    )
    .await;

    assert_eq!(db.list_buckets().await.unwrap(), vec![BUCKET, "2025110111"]);
    assert_eq!(db.country_totals("2025110111").await.unwrap()["USA"], 1);
    assert_eq!(db.country_totals(BUCKET).await.unwrap()["USA"], 1);
}

#[tokio::test]
async fn test_top_entities_ranking() {
    let db = Database::in_memory().await.unwrap();
    let mentions = [
        vec!["Alpha"],
        vec!["Beta", "Alpha"],
        vec!["Gamma", "Beta", "Alpha"],
        vec!["Delta"],
    ];
    for (i, names) in mentions.iter().enumerate() {
        let mut event = Event::new(&format!("story {}", i), Some("USA"), at(i as u32));
        for name in names {
            event = event.with_entity(name, EntityType::Other);
        }
        ingest(&db, event).await;
    }

    let top = db.top_entities(BUCKET, 3).await.unwrap();
    assert_eq!(top.len(), 3);
    assert_eq!(top[0].name, "Alpha");
    assert_eq!(top[0].count, 3);
    assert_eq!(top[1].name, "Beta");
    assert!(top.windows(2).all(|w| w[0].count >= w[1].count));

    // a point lookup returns the same cell the ranking does
    assert_eq!(db.entity_total(BUCKET, "alpha").await.unwrap(), Some(top[0].clone()));

    assert!(db.top_entities(BUCKET, 0).await.unwrap().is_empty());
    assert!(db.top_entities(BUCKET, -1).await.unwrap().is_empty());
    assert!(db.top_entities("2024010100", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_bucket_reads_are_empty_not_errors() {
    let db = Database::in_memory().await.unwrap();
    assert!(db.country_totals(BUCKET).await.unwrap().is_empty());
    assert!(db
        .top_entities_for_country(BUCKET, "USA", 5)
        .await
        .unwrap()
        .is_empty());
    assert!(db
        .country_breakdown_for_entity(BUCKET, "NASA")
        .await
        .unwrap()
        .is_empty());
    assert!(db.entity_total(BUCKET, "NASA").await.unwrap().is_none());
    assert!(db.list_buckets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_article_is_an_error() {
    let db = Database::in_memory().await.unwrap();
    assert!(matches!(
        db.apply_event("missing").await,
        Err(AtlasError::EventNotFound(id)) if id == "missing"
    ));
}

#[tokio::test]
async fn test_article_without_time_is_malformed_and_untouched() {
    let db = Database::in_memory().await.unwrap();
    let event = Event {
        id: Some("no-time".to_string()),
        title: "Undated".to_string(),
        country: Some("USA".to_string()),
        ..Default::default()
    };
    let id = db.store_event(&event).await.unwrap();

    assert!(matches!(
        db.apply_event(&id).await,
        Err(AtlasError::MalformedEvent(_))
    ));
    let stored = db.get_article(&id).await.unwrap().unwrap();
    assert!(!stored.processed);
    assert!(db.list_buckets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_helper_passes_through_permanent_errors() {
    let db = Database::in_memory().await.unwrap();
    assert!(matches!(
        db.apply_event_with_retry("missing", 3).await,
        Err(AtlasError::EventNotFound(_))
    ));

    let id = db
        .store_event(&Event::new("Fine", Some("USA"), at(1)))
        .await
        .unwrap();
    db.apply_event_with_retry(&id, 3).await.unwrap();
    db.apply_event_with_retry(&id, 3).await.unwrap();
    assert_eq!(db.country_totals(BUCKET).await.unwrap()["USA"], 1);
}

#[tokio::test]
async fn test_zero_timeout_fails_without_side_effects() {
    let db = Database::in_memory().await.unwrap();
    let id = db
        .store_event(&Event::new("Slow", Some("USA"), at(1)))
        .await
        .unwrap();

    let impatient = db.clone().with_timeout(Duration::ZERO);
    let result = impatient.apply_event(&id).await;
    assert!(matches!(result, Err(AtlasError::Timeout(_))));

    // the abandoned transaction left nothing behind, and a normal run still applies
    assert!(db.country_totals(BUCKET).await.unwrap().is_empty());
    db.apply_event(&id).await.unwrap();
    assert_eq!(db.country_totals(BUCKET).await.unwrap()["USA"], 1);
}

#[tokio::test]
async fn test_concurrent_rollups_of_one_article_count_once() {
    let db = Database::in_memory().await.unwrap();
    let id = db
        .store_event(
            &Event::new("Race", Some("USA"), at(1)).with_entity("NASA", EntityType::Organization),
        )
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        db.apply_event_with_retry(&id, 5),
        db.apply_event_with_retry(&id, 5),
        db.apply_event_with_retry(&id, 5)
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(db.country_totals(BUCKET).await.unwrap()["USA"], 1);
    assert_eq!(db.entity_total(BUCKET, "NASA").await.unwrap().unwrap().count, 1);
}

/// File-backed database with a real pool, so rollups run on separate connections.
async fn file_database(dir: &TempDir, connections: u32) -> Database {
    let path = dir.path().join("atlas.db");
    Database::new(&path.to_string_lossy(), connections, Duration::from_secs(30))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rollups_of_different_events_do_not_conflict() {
    let dir = TempDir::new().expect("temp dir");
    let db = file_database(&dir, 8).await;

    let mut ids = Vec::new();
    for i in 0..40 {
        let event = Event::new(&format!("story {}", i), Some("USA"), at(i % 60))
            .with_entity("NASA", EntityType::Organization);
        ids.push(db.store_event(&event).await.unwrap());
    }

    let handles: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let db = db.clone();
            tokio::spawn(async move { db.apply_event(&id).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_ok(), "rollup failed: {:?}", result);
    }

    assert_eq!(db.country_totals(BUCKET).await.unwrap()["USA"], 40);
    assert_eq!(db.entity_total(BUCKET, "NASA").await.unwrap().unwrap().count, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rollups_of_one_event_on_a_pool_count_once() {
    let dir = TempDir::new().expect("temp dir");
    let db = file_database(&dir, 8).await;
    let id = db
        .store_event(
            &Event::new("Race", Some("USA"), at(1)).with_entity("NASA", EntityType::Organization),
        )
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            let id = id.clone();
            tokio::spawn(async move { db.apply_event(&id).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(db.country_totals(BUCKET).await.unwrap()["USA"], 1);
    assert_eq!(db.entity_total(BUCKET, "NASA").await.unwrap().unwrap().count, 1);
    assert_eq!(
        db.country_breakdown_for_entity(BUCKET, "NASA").await.unwrap()["USA"],
        1
    );
}

#[tokio::test]
async fn test_failure_mid_rollup_rolls_everything_back() {
    let db = Database::in_memory().await.unwrap();
    let id = db
        .store_event(
            &Event::new("Partial", Some("USA"), at(1)).with_entity("NASA", EntityType::Organization),
        )
        .await
        .unwrap();

    // the last counter family written in a rollup; everything before it succeeds
    sqlx::query("DROP TABLE country_entity_counts")
        .execute(db.pool())
        .await
        .unwrap();

    assert!(matches!(db.apply_event(&id).await, Err(AtlasError::Store(_))));

    let stored = db.get_article(&id).await.unwrap().unwrap();
    assert!(!stored.processed);
    assert_eq!(stored.bucket, None);
    assert!(db.country_totals(BUCKET).await.unwrap().is_empty());
    assert!(db.entity_total(BUCKET, "NASA").await.unwrap().is_none());
    assert!(db
        .country_breakdown_for_entity(BUCKET, "NASA")
        .await
        .unwrap()
        .is_empty());
}
