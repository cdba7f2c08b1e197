use std::fmt;

/// `(bucket, country, entity)`; an empty filter is the same as no filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub bucket: String,
    pub country: Option<String>,
    pub entity: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

impl CacheKey {
    pub fn new(bucket: &str, country: Option<&str>, entity: Option<&str>) -> Self {
        Self {
            bucket: bucket.to_string(),
            country: non_empty(country),
            entity: non_empty(entity),
        }
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    /// Keys whose lists are supersets of this one: country-only, then entity-only.
    /// Only a key with both filters has any.
    pub fn broader_keys(&self) -> Vec<CacheKey> {
        match (&self.country, &self.entity) {
            (Some(country), Some(entity)) => vec![
                CacheKey::new(&self.bucket, Some(country), None),
                CacheKey::new(&self.bucket, None, Some(entity)),
            ],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.bucket,
            self.country().unwrap_or_default(),
            self.entity().unwrap_or_default()
        )
    }
}
