use async_trait::async_trait;

use crate::error::Result;
use crate::model::ArticleRecord;

/// Filtered article fetch from the backing store.
///
/// Returns at most `limit` rolled-up articles of `bucket` matching every filter
/// that is set. Order is not relied upon; the cache re-sorts.
#[async_trait]
pub trait ArticleLoader: Send + Sync {
    async fn fetch(
        &self,
        bucket: &str,
        country: Option<&str>,
        entity: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArticleRecord>>;
}
