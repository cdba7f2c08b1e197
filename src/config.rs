use std::time::Duration;

use crate::cache::CacheConfig;
use crate::environment::{get_env_var_or, get_env_var_string};

pub const DEFAULT_DATABASE_PATH: &str = "atlas.db";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_ROLLUP_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_PAGE_SIZE: usize = 3;
pub const DEFAULT_TOP_ENTITIES_LIMIT: i64 = 20;

/// Runtime settings, read from the environment.
#[derive(Debug, Clone)]
pub struct AtlasConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub store_timeout: Duration,
    pub rollup_max_attempts: u32,
    pub page_size: usize,
    pub top_entities_limit: i64,
    pub cache: CacheConfig,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            rollup_max_attempts: DEFAULT_ROLLUP_MAX_ATTEMPTS,
            page_size: DEFAULT_PAGE_SIZE,
            top_entities_limit: DEFAULT_TOP_ENTITIES_LIMIT,
            cache: CacheConfig::default(),
        }
    }
}

impl AtlasConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let store_timeout = Duration::from_millis(get_env_var_or(
            "STORE_TIMEOUT_MS",
            DEFAULT_STORE_TIMEOUT_MS,
        ));

        Self {
            database_path: get_env_var_string("DATABASE_PATH", DEFAULT_DATABASE_PATH),
            max_connections: get_env_var_or("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)
                .max(1),
            store_timeout,
            rollup_max_attempts: get_env_var_or("ROLLUP_MAX_ATTEMPTS", DEFAULT_ROLLUP_MAX_ATTEMPTS)
                .max(1),
            page_size: get_env_var_or("ARTICLES_PAGE_SIZE", DEFAULT_PAGE_SIZE).max(1),
            top_entities_limit: get_env_var_or("TOP_ENTITIES_LIMIT", DEFAULT_TOP_ENTITIES_LIMIT),
            cache: CacheConfig {
                max_entries: get_env_var_or("CACHE_MAX_ENTRIES", defaults.cache.max_entries)
                    .max(1),
                open_bucket_ttl: Duration::from_secs(get_env_var_or(
                    "CACHE_OPEN_BUCKET_TTL_SECS",
                    defaults.cache.open_bucket_ttl.as_secs(),
                )),
                fetch_timeout: store_timeout,
            },
        }
    }
}
