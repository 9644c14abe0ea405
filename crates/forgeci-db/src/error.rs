//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// True when the error is a lost race against a concurrent creator and
    /// re-reading will succeed.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DbError::Duplicate(_))
    }
}

/// Map a unique-constraint violation to [`DbError::Duplicate`] so callers
/// can resolve create races by re-fetching.
pub(crate) fn map_insert_error(e: sqlx::Error, what: impl Into<String>) -> DbError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return DbError::Duplicate(what.into());
        }
    }
    DbError::Database(e)
}

pub type DbResult<T> = std::result::Result<T, DbError>;
