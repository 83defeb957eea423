//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored row that does not map onto the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<herald_core::Error> for DbError {
    fn from(err: herald_core::Error) -> Self {
        match err {
            herald_core::Error::NotFound(msg) => DbError::NotFound(msg),
            herald_core::Error::Conflict(msg) => DbError::Conflict(msg),
            herald_core::Error::InvalidInput(msg) => DbError::InvalidInput(msg),
            other => DbError::Corrupt(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
