use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::util::{entity_id, parse_timestamp};

/// Entity type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Product,
    Other,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Person => write!(f, "PERSON"),
            EntityType::Organization => write!(f, "ORGANIZATION"),
            EntityType::Location => write!(f, "LOCATION"),
            EntityType::Event => write!(f, "EVENT"),
            EntityType::Product => write!(f, "PRODUCT"),
            EntityType::Other => write!(f, "OTHER"),
        }
    }
}

// Extractors disagree on labels; NER short forms map onto the same variants.
impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "PERSON" | "PER" => EntityType::Person,
            "ORGANIZATION" | "ORG" => EntityType::Organization,
            "LOCATION" | "LOC" | "GPE" => EntityType::Location,
            "EVENT" => EntityType::Event,
            "PRODUCT" => EntityType::Product,
            _ => EntityType::Other,
        }
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        EntityType::from(s.as_str())
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.to_string()
    }
}

impl Default for EntityType {
    fn default() -> Self {
        EntityType::Other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: EntityType,
}

impl EventEntity {
    pub fn new(name: &str, entity_type: EntityType) -> Self {
        Self {
            name: name.to_string(),
            entity_type,
        }
    }

    pub fn id(&self) -> String {
        entity_id(&self.name)
    }
}

/// A tagged news event as delivered by ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "deserialize_time")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entities: Vec<EventEntity>,
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(value) => parse_timestamp(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unparseable time '{}'", value))),
    }
}

impl Event {
    pub fn new(title: &str, country: Option<&str>, time: DateTime<Utc>) -> Self {
        Self {
            title: title.to_string(),
            country: country.map(str::to_string),
            time: Some(time),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_entity(mut self, name: &str, entity_type: EntityType) -> Self {
        self.entities.push(EventEntity::new(name, entity_type));
        self
    }

    /// Entities with empty names dropped and duplicates (same identifier) collapsed,
    /// keeping the first occurrence's display name and type.
    pub fn distinct_entities(&self) -> Vec<EventEntity> {
        dedup_entities(&self.entities)
    }
}

pub fn dedup_entities(entities: &[EventEntity]) -> Vec<EventEntity> {
    let mut seen = std::collections::HashSet::new();
    entities
        .iter()
        .filter(|e| !e.name.trim().is_empty())
        .filter(|e| seen.insert(e.id()))
        .map(|e| EventEntity::new(e.name.trim(), e.entity_type))
        .collect()
}

/// Stored projection of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleRecord {
    pub id: String,
    pub title: String,
    pub text: String,
    pub url: String,
    pub country: String,
    pub time: Option<DateTime<Utc>>,
    pub entities: Vec<EventEntity>,
    pub entity_ids: Vec<String>,
    pub bucket: Option<String>,
    pub processed: bool,
}

impl ArticleRecord {
    /// True if the record mentions `entity`, given either as a display name or an id.
    pub fn mentions_entity(&self, entity: &str) -> bool {
        let normalized = entity_id(entity);
        self.entity_ids
            .iter()
            .any(|id| *id == normalized || id == entity)
    }

    pub fn matches(&self, country: Option<&str>, entity: Option<&str>) -> bool {
        if let Some(country) = country {
            if self.country != country {
                return false;
            }
        }
        match entity {
            Some(entity) => self.mentions_entity(entity),
            None => true,
        }
    }
}

/// One entity counter cell: a bucket-wide total, or a per-country count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCount {
    pub entity_id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub count: i64,
}
