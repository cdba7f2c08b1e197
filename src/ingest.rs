use tracing::{instrument, warn};

use crate::db::Database;
use crate::error::{AtlasError, Result};
use crate::model::Event;
use crate::TARGET_ROLLUP;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and rolled up (or already rolled up earlier) under this article id.
    Applied(String),
    /// The event can never be rolled up; carries the reason.
    Dropped(String),
}

/// Stores `event` and rolls it up, retrying conflicts up to `max_attempts` times.
///
/// Malformed events are dropped rather than returned as errors, since no retry
/// can fix them. Conflicts that outlast the retries, timeouts and store failures
/// are returned to the caller.
#[instrument(target = "db", level = "debug", skip(db, event), fields(title = %event.title))]
pub async fn ingest_event(db: &Database, event: &Event, max_attempts: u32) -> Result<IngestOutcome> {
    let applied = async {
        let article_id = db.store_event(event).await?;
        db.apply_event_with_retry(&article_id, max_attempts).await?;
        Ok(article_id)
    };

    match applied.await {
        Ok(article_id) => Ok(IngestOutcome::Applied(article_id)),
        Err(AtlasError::MalformedEvent(reason)) => {
            warn!(target: TARGET_ROLLUP, "Dropping event '{}': {}", event.title, reason);
            Ok(IngestOutcome::Dropped(reason))
        }
        Err(e) => Err(e),
    }
}
