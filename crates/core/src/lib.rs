//! Core domain types for the tapevault tape storage tier.
//!
//! This crate defines the data model shared by every other crate:
//! - Digest algorithms and incremental digesters
//! - TAR entry descriptors and archive locations
//! - Tape cartridges, their lifecycle state and physical location
//! - Work queue messages (write and read orders)
//! - Access request identifiers and statuses
//! - Field criteria used by catalog and queue lookups
//! - Configuration

pub mod access_request;
pub mod archive;
pub mod config;
pub mod criteria;
pub mod digest;
pub mod error;
pub mod queue;
pub mod tape;

pub use access_request::{AccessRequestId, AccessRequestStatus};
pub use archive::{ArchiveLocation, ArchiveLocationType, ObjectLocation, TarEntryDescription};
pub use criteria::{QueryCriteria, QueryOperator};
pub use digest::{DigestType, Digester};
pub use error::{Error, Result};
pub use queue::{
    DEFAULT_PRIORITY, QueueMessage, QueueMessageType, QueueOrder, QueueState, QueueUpdate,
    ReadOrder, WriteOrder,
};
pub use tape::{TapeCatalog, TapeLocation, TapeState};

/// TAR block size in bytes.
pub const TAR_BLOCK_SIZE: u64 = 512;

/// Default maximum size of a TAR container: 8 GiB.
pub const DEFAULT_MAX_TAR_FILE_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Default maximum size of a single TAR entry: 1 GiB.
pub const DEFAULT_MAX_TAR_ENTRY_SIZE: u64 = 1024 * 1024 * 1024;
