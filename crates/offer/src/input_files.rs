//! Objects written by callers before they are packed into a TAR.

use std::path::{Path, PathBuf};
use tapevault_core::DigestType;
use tapevault_storage::persist::{digest_path, persist_stream};
use tapevault_storage::{ByteStream, StorageResult};

/// Input files directory, laid out as `{root}/{container}/{storage_id}`.
///
/// Each write gets a fresh storage id, so a rewrite of an object never
/// touches the file of the write being packed.
#[derive(Clone, Debug)]
pub struct InputFileStorage {
    root: PathBuf,
}

impl InputFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, container: &str, storage_id: &str) -> PathBuf {
        self.root.join(container).join(storage_id)
    }

    /// Durably store `size` bytes and return their digest.
    pub async fn write(
        &self,
        container: &str,
        storage_id: &str,
        object_name: &str,
        input: ByteStream,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<String> {
        persist_stream(
            &self.path(container, storage_id),
            input,
            digest_type,
            size,
            object_name,
        )
        .await
    }

    /// Recompute the digest of a stored input file.
    pub async fn digest(
        &self,
        container: &str,
        storage_id: &str,
        digest_type: DigestType,
    ) -> StorageResult<(String, u64)> {
        digest_path(&self.path(container, storage_id), digest_type).await
    }

    /// Remove an input file. Missing files are fine.
    pub async fn remove(&self, container: &str, storage_id: &str) -> std::io::Result<()> {
        remove_if_exists(&self.path(container, storage_id)).await
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
