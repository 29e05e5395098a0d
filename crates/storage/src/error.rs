//! Storage error types.

use thiserror::Error;

/// Errors of the content-addressable storage surface.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// The object lives on tape only and must be staged through an access request.
    /// Retryable.
    #[error("object unavailable, staging required: {0}")]
    Unavailable(String),

    /// Stored bytes no longer match their recorded digest.
    #[error("corruption detected on {object}: expected digest {expected}, got {actual}")]
    Corruption {
        object: String,
        expected: String,
        actual: String,
    },

    /// The input stream did not deliver the announced content.
    #[error("transfer corrupted for {object}: expected {expected} bytes, got {actual}")]
    TransferCorrupted {
        object: String,
        expected: u64,
        actual: u64,
    },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TAR error: {0}")]
    Tar(#[from] TarError),

    /// Failure of a collaborator (metadata store, device layer).
    #[error("server error: {0}")]
    Server(String),
}

impl StorageError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// TAR container errors.
#[derive(Debug, Error)]
pub enum TarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Digest of the bytes read differs from the recorded one.
    #[error("corruption detected in {entry}: expected digest {expected}, got {actual}")]
    Corruption {
        entry: String,
        expected: String,
        actual: String,
    },

    /// Entry range is not within the durable part of the container.
    #[error("entry {entry} out of range: ends at {end}, container holds {len} bytes")]
    OutOfRange { entry: String, end: u64, len: u64 },

    #[error("invalid TAR header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    /// Input ended before the announced size, or the entry would overflow the container.
    #[error("invalid entry {entry}: {reason}")]
    InvalidEntry { entry: String, reason: String },

    #[error("invalid index: {0}")]
    InvalidIndex(String),
}

impl TarError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result type for TAR operations.
pub type TarResult<T> = std::result::Result<T, TarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_is_distinct_from_io() {
        let corruption = TarError::Corruption {
            entry: "e".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(corruption.is_corruption());
        assert!(!TarError::Io(std::io::Error::other("disk")).is_corruption());
    }

    #[test]
    fn test_unsupported() {
        assert!(StorageError::Unsupported("list_container").is_unsupported());
        assert!(!StorageError::NotFound("x".into()).is_unsupported());
    }
}
