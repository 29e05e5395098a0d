//! Append-only TAR containers.
//!
//! Objects are packed as regular ustar entries. Every entry is located by a
//! [`TarEntryDescription`](tapevault_core::TarEntryDescription) holding the
//! offset of its first data byte, its length and its digest, so reads seek
//! straight to the data without walking the archive.

mod header;
mod reader;
mod writer;

pub use header::{MAX_ENTRY_SIZE, padded_size};
pub use reader::{ScannedEntry, copy_entry, read_entry, scan_entries, stream_entries};
pub use writer::{SealedTar, TarAppender, discard_index, index_path};
