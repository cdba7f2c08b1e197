use std::collections::BTreeMap;

use crate::db::Database;
use crate::error::Result;
use crate::model::EntityCount;
use crate::util::entity_id;

/// Counters the caller already read for the current request.
///
/// They may lag the store slightly. A stale expected count can only cause an extra
/// fetch, never an incomplete answer, so the cache never re-reads them itself.
#[derive(Debug, Clone, Default)]
pub struct AggregateSnapshot {
    pub country_totals: Option<BTreeMap<String, i64>>,
    pub breakdown_by_country: Option<EntityBreakdown>,
    pub top_entities: Option<Vec<EntityCount>>,
}

/// Per-country counts of one entity, keyed by the entity they were read for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBreakdown {
    pub entity_id: String,
    pub by_country: BTreeMap<String, i64>,
}

impl AggregateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_country_totals(mut self, totals: BTreeMap<String, i64>) -> Self {
        self.country_totals = Some(totals);
        self
    }

    /// `entity` may be a display name or an id.
    pub fn with_breakdown_by_country(mut self, entity: &str, by_country: BTreeMap<String, i64>) -> Self {
        self.breakdown_by_country = Some(EntityBreakdown {
            entity_id: entity_id(entity),
            by_country,
        });
        self
    }

    pub fn with_top_entities(mut self, top: Vec<EntityCount>) -> Self {
        self.top_entities = Some(top);
        self
    }

    /// Reads everything a dashboard request would already hold for `bucket`.
    pub async fn load(
        db: &Database,
        bucket: &str,
        entity: Option<&str>,
        top_limit: i64,
    ) -> Result<Self> {
        let mut snapshot = Self::new()
            .with_country_totals(db.country_totals(bucket).await?)
            .with_top_entities(db.top_entities(bucket, top_limit).await?);
        if let Some(entity) = entity {
            let by_country = db.country_breakdown_for_entity(bucket, entity).await?;
            snapshot = snapshot.with_breakdown_by_country(entity, by_country);
        }
        Ok(snapshot)
    }

    /// Exact number of articles matching the filters, when the snapshot can tell.
    pub fn expected_count(&self, country: Option<&str>, entity: Option<&str>) -> Option<i64> {
        match (country, entity) {
            (Some(country), Some(entity)) => {
                let breakdown = self.breakdown_by_country.as_ref()?;
                if breakdown.entity_id != entity_id(entity) {
                    return None;
                }
                breakdown.by_country.get(country).copied()
            }
            (None, Some(entity)) => {
                let wanted = entity_id(entity);
                self.top_entities
                    .as_ref()?
                    .iter()
                    .find(|e| e.name == entity || entity_id(&e.name) == wanted)
                    .map(|e| e.count)
            }
            (Some(country), None) => self.country_totals.as_ref()?.get(country).copied(),
            (None, None) => None,
        }
    }
}
