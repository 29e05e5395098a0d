//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
///
/// Driver errors are always wrapped; callers never see a raw `sqlx` error
/// outside of `Database`.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A conditional catalog move found the tape somewhere else.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MetadataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<tapevault_core::Error> for MetadataError {
    fn from(e: tapevault_core::Error) -> Self {
        match e {
            tapevault_core::Error::InvalidCriteria(msg) => Self::InvalidArgument(msg),
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Map a UNIQUE violation on `table` to `AlreadyExists`, pass anything else through.
pub(crate) fn map_unique_violation(err: sqlx::Error, table: &str, what: String) -> MetadataError {
    match err {
        sqlx::Error::Database(db_err)
            if db_err.message().contains("UNIQUE constraint") && db_err.message().contains(table) =>
        {
            MetadataError::AlreadyExists(what)
        }
        other => MetadataError::Database(other),
    }
}
