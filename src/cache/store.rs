use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::key::CacheKey;
use super::loader::ArticleLoader;
use super::snapshot::AggregateSnapshot;
use crate::error::{AtlasError, Result};
use crate::model::ArticleRecord;
use crate::util::is_open_bucket;
use crate::TARGET_CACHE;

struct CacheEntry {
    records: Vec<ArticleRecord>,
    // Set when the list filled its fetch limit and may be cut short.
    truncated_at: Option<usize>,
    inserted_at: Instant,
}

impl CacheEntry {
    fn covers(&self, page_size: usize) -> bool {
        self.truncated_at.map_or(true, |limit| page_size <= limit)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    superset_reuses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub superset_reuses: u64,
    pub fetches: u64,
    pub evictions: u64,
}

/// Most recent first; records with equal times keep their relative order.
pub fn sort_and_trim(mut records: Vec<ArticleRecord>, page_size: usize) -> Vec<ArticleRecord> {
    records.sort_by(|a, b| b.time.cmp(&a.time));
    records.truncate(page_size);
    records
}

pub struct ArticleCache {
    loader: Arc<dyn ArticleLoader>,
    config: CacheConfig,
    entries: DashMap<CacheKey, CacheEntry>,
    // One lock per key being fetched, so concurrent misses share a single fetch.
    fetch_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    counters: Counters,
}

impl ArticleCache {
    pub fn new(loader: Arc<dyn ArticleLoader>, config: CacheConfig) -> Self {
        Self {
            loader,
            config,
            entries: DashMap::new(),
            fetch_locks: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Up to `page_size` most recent articles of `bucket` matching the filters.
    ///
    /// Serves, in order: an exact cached list; a cached country-only or entity-only
    /// list filtered down, if `snapshot` proves it complete; a loader fetch. Failed
    /// fetches leave the cache untouched.
    #[instrument(target = "cache", level = "debug", skip(self, snapshot))]
    pub async fn get(
        &self,
        bucket: &str,
        country: Option<&str>,
        entity: Option<&str>,
        page_size: usize,
        snapshot: &AggregateSnapshot,
    ) -> Result<Vec<ArticleRecord>> {
        if bucket.is_empty() {
            return Ok(Vec::new());
        }

        let key = CacheKey::new(bucket, country, entity);

        if let Some(records) = self.lookup(&key, page_size) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(target: TARGET_CACHE, "Cache hit for {}", key);
            return Ok(sort_and_trim(records, page_size));
        }

        let expected = snapshot.expected_count(key.country(), key.entity());
        if let Some(records) = self.reuse_superset(&key, expected) {
            return Ok(sort_and_trim(records, page_size));
        }

        self.fetch_and_store(&key, page_size).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drops every list of a bucket older than `bucket`, returning how many went.
    pub fn evict_before(&self, bucket: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.bucket.as_str() >= bucket);
        let evicted = before.saturating_sub(self.entries.len());
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            superset_reuses: self.counters.superset_reuses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn is_expired(&self, key: &CacheKey, entry: &CacheEntry) -> bool {
        is_open_bucket(&key.bucket, &Utc::now())
            && entry.inserted_at.elapsed() >= self.config.open_bucket_ttl
    }

    /// Cached list for `key` if it is fresh and holds at least `page_size` rows
    /// or every match.
    fn lookup(&self, key: &CacheKey, page_size: usize) -> Option<Vec<ArticleRecord>> {
        {
            let entry = self.entries.get(key)?;
            if !self.is_expired(key, &entry) {
                return entry.covers(page_size).then(|| entry.records.clone());
            }
        }
        // The read guard has to be released before touching the same shard again.
        if self
            .entries
            .remove_if(key, |k, entry| self.is_expired(k, entry))
            .is_some()
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(target: TARGET_CACHE, "Expired {}", key);
        }
        None
    }

    fn insert(&self, key: CacheKey, records: Vec<ArticleRecord>, truncated_at: Option<usize>) {
        self.entries.insert(
            key,
            CacheEntry {
                records,
                truncated_at,
                inserted_at: Instant::now(),
            },
        );
        self.enforce_capacity();
    }

    // Keys order by bucket first, and bucket keys order chronologically.
    fn enforce_capacity(&self) {
        let excess = self.entries.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return;
        }

        let mut keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        for key in keys.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(target: TARGET_CACHE, "Evicted {} to stay within {} entries", key, self.config.max_entries);
            }
        }
    }

    /// A broader list holding at least `expected` matches holds all of them:
    /// `expected` is the true number of matches in the bucket.
    fn reuse_superset(&self, key: &CacheKey, expected: Option<i64>) -> Option<Vec<ArticleRecord>> {
        let expected = expected?;

        for parent in key.broader_keys() {
            // Completeness comes from the expected count, not the parent's limit.
            let Some(parent_records) = self.lookup(&parent, 0) else {
                continue;
            };
            let filtered: Vec<ArticleRecord> = parent_records
                .into_iter()
                .filter(|r| r.matches(key.country(), key.entity()))
                .collect();

            if filtered.len() as i64 >= expected {
                debug!(
                    target: TARGET_CACHE,
                    "Serving {} from {} ({} of {} expected)",
                    key,
                    parent,
                    filtered.len(),
                    expected
                );
                self.counters.superset_reuses.fetch_add(1, Ordering::Relaxed);
                self.insert(key.clone(), filtered.clone(), None);
                return Some(filtered);
            }

            debug!(
                target: TARGET_CACHE,
                "{} holds only {} of {} expected for {}",
                parent,
                filtered.len(),
                expected,
                key
            );
        }

        None
    }

    async fn fetch_and_store(&self, key: &CacheKey, page_size: usize) -> Result<Vec<ArticleRecord>> {
        let lock = self
            .fetch_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match self.lookup(key, page_size) {
                Some(records) => {
                    debug!(target: TARGET_CACHE, "{} was fetched by a concurrent caller", key);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(records)
                }
                None => self.fetch(key, page_size).await.map(|records| {
                    let truncated_at = (records.len() >= page_size).then_some(page_size);
                    self.insert(key.clone(), records.clone(), truncated_at);
                    records
                }),
            }
        };

        // Map plus our clone: nobody else is waiting on this key.
        self.fetch_locks
            .remove_if(key, |_, held| Arc::strong_count(held) <= 2);

        result.map(|records| sort_and_trim(records, page_size))
    }

    async fn fetch(&self, key: &CacheKey, page_size: usize) -> Result<Vec<ArticleRecord>> {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(target: TARGET_CACHE, "Fetching {} (limit {})", key, page_size);

        let fetch = self
            .loader
            .fetch(&key.bucket, key.country(), key.entity(), page_size);
        match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => {
                warn!(target: TARGET_CACHE, "Fetch of {} timed out after {:?}", key, self.config.fetch_timeout);
                Err(AtlasError::Timeout(self.config.fetch_timeout))
            }
        }
    }
}
