use std::time::Duration;

pub const DEFAULT_MAX_ENTRIES: usize = 1024;
pub const DEFAULT_OPEN_BUCKET_TTL_SECS: u64 = 60;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on cached lists; the oldest buckets are evicted first.
    pub max_entries: usize,
    /// Lifetime of lists for the current hour, whose counters are still moving.
    /// Lists for elapsed hours never expire by age.
    pub open_bucket_ttl: Duration,
    pub fetch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            open_bucket_ttl: Duration::from_secs(DEFAULT_OPEN_BUCKET_TTL_SECS),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
        }
    }
}
