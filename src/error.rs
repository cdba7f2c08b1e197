use thiserror::Error;

pub type Result<T> = std::result::Result<T, AtlasError>;

#[derive(Debug, Error)]
pub enum AtlasError {
    /// Another transaction touched the same rows; the caller may re-run the rollup.
    #[error("transaction conflicted with a concurrent write")]
    RetryableConflict,

    #[error("backing store did not answer within {0:?}")]
    Timeout(std::time::Duration),

    /// Permanent: retrying cannot repair missing data.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("event {0} does not exist")]
    EventNotFound(String),

    #[error("invalid stored json: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(sqlx::Error),
}

impl AtlasError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AtlasError::RetryableConflict)
    }
}

// SQLite reports a lost write race as SQLITE_BUSY (5) or SQLITE_LOCKED (6), possibly
// with an extended code in the upper bits (e.g. 517 = SQLITE_BUSY_SNAPSHOT).
pub trait DbLockErrorExt {
    fn is_database_lock_error(&self) -> bool;
}

impl DbLockErrorExt for sqlx::Error {
    fn is_database_lock_error(&self) -> bool {
        match self {
            sqlx::Error::Database(err) => err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map_or(false, |code| matches!(code & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for AtlasError {
    fn from(err: sqlx::Error) -> Self {
        if err.is_database_lock_error() {
            AtlasError::RetryableConflict
        } else {
            AtlasError::Store(err)
        }
    }
}
