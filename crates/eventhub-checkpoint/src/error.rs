//! Checkpoint Store Error Types
//!
//! All store operations return `Result<T>`, aliased to
//! `Result<T, CheckpointStoreError>`. A claim that loses an optimistic
//! concurrency race is *not* an error: it is simply missing from the result
//! of `claim_ownership`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointStoreError>;

#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::migrate::MigrateError> for CheckpointStoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        CheckpointStoreError::MigrationError(e.to_string())
    }
}
