//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A state transition was requested from the wrong state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for beacon_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => beacon_core::Error::NotFound(what),
            other => beacon_core::Error::Persistence(other.to_string()),
        }
    }
}
