//! Hierarchical article cache.
//!
//! Article lists are cached per `(bucket, country, entity)`. A query with both a
//! country and an entity can be answered from a cached broader list (country only
//! or entity only) when the rollup counters prove that the broader list already
//! holds every matching article. Anything else goes to the [`ArticleLoader`].

mod config;
mod key;
mod loader;
mod snapshot;
mod store;


pub use config::CacheConfig;
pub use key::CacheKey;
pub use loader::ArticleLoader;
pub use snapshot::{AggregateSnapshot, EntityBreakdown};
pub use store::{sort_and_trim, ArticleCache, CacheStats};
