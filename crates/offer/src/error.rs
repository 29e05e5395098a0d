//! Tape offer error types.

use tapevault_device::DeviceError;
use tapevault_metadata::MetadataError;
use tapevault_storage::{StorageError, TarError};
use thiserror::Error;

/// Errors raised by the tape offer components.
#[derive(Debug, Error)]
pub enum OfferError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// External tool failure, with its captured output.
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tar(#[from] TarError),

    #[error("invalid tape transition: {0}")]
    Tape(#[from] tapevault_core::Error),

    #[error("no writable tape available for bucket {0}")]
    NoTapeAvailable(String),

    #[error("tape not found: {0}")]
    TapeNotFound(String),

    /// The drive reports a file number the catalog does not expect.
    #[error("tape {tape} is at file {actual}, expected {expected}")]
    PositionMismatch {
        tape: String,
        expected: u32,
        actual: u32,
    },

    #[error("archive cache is full: cannot reserve {0} bytes")]
    CacheFull(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for offer operations.
pub type OfferResult<T> = std::result::Result<T, OfferError>;

impl From<OfferError> for StorageError {
    fn from(e: OfferError) -> Self {
        match e {
            OfferError::Storage(inner) => inner,
            OfferError::Tar(inner) => StorageError::Tar(inner),
            OfferError::Metadata(MetadataError::NotFound(what)) => StorageError::NotFound(what),
            OfferError::InvalidArgument(msg) => StorageError::InvalidName(msg),
            OfferError::Io(inner) => StorageError::Io(inner),
            other => StorageError::Server(other.to_string()),
        }
    }
}
