//! Storage building blocks for tapevault.
//!
//! This crate provides:
//! - Append-only TAR containers with a durable entry index and verified reads
//! - The content-addressable storage surface shared by every offer, including
//!   the optional access-request (staging) operations
//! - Durable stream-to-file writes with digest computation
//! - A plain filesystem offer

pub mod backends;
pub mod error;
pub mod persist;
pub mod tar;
pub mod traits;

pub use backends::filesystem::FilesystemStorage;
pub use error::{StorageError, StorageResult, TarError, TarResult};
pub use tar::{SealedTar, TarAppender};
pub use traits::{
    ByteStream, ContainerInformation, ContentAddressableStorage, ObjectContent, ObjectEntry,
    ObjectEntryStream, StorageMetadata, check_availability, collect_stream, stream_from_bytes,
};
