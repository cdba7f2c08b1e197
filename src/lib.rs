pub mod cache;
pub mod config;
pub mod db;
pub mod environment;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod util;

pub use error::{AtlasError, Result};

pub const TARGET_DB: &str = "db_query";
pub const TARGET_ROLLUP: &str = "rollup";
pub const TARGET_CACHE: &str = "cache";
