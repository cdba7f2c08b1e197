mod article;
pub mod core;
mod mentions;
mod rollup;
mod schema;

#[cfg(test)]
mod tests;

// Re-export Database and the lock classification used by callers
pub use self::core::Database;
pub use crate::error::DbLockErrorExt;
