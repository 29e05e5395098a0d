//! Archive location referential.

use crate::error::MetadataResult;
use crate::models::ArchiveRow;
use async_trait::async_trait;
use tapevault_core::ArchiveLocationType;

/// Where each TAR container lives.
#[async_trait]
pub trait ArchiveReferentialRepo: Send + Sync {
    async fn insert_archive(&self, archive: &ArchiveRow) -> MetadataResult<()>;

    async fn find_archive(&self, archive_id: &str) -> MetadataResult<Option<ArchiveRow>>;

    async fn find_archives(&self, archive_ids: &[String]) -> MetadataResult<Vec<ArchiveRow>>;

    /// Mark a sealed TAR as waiting on disk for a tape write.
    ///
    /// Never moves an archive already on tape back to disk.
    async fn update_location_to_ready_on_disk(
        &self,
        archive_id: &str,
        size: u64,
        digest: &str,
    ) -> MetadataResult<bool>;

    /// Record the tape and file mark a TAR was written at.
    async fn update_location_to_on_tape(
        &self,
        archive_id: &str,
        tape_code: &str,
        file_position: u32,
    ) -> MetadataResult<bool>;

    async fn list_archives_by_location(
        &self,
        location: ArchiveLocationType,
    ) -> MetadataResult<Vec<ArchiveRow>>;

    /// Forget an archive that never received any entry.
    async fn delete_archive(&self, archive_id: &str) -> MetadataResult<bool>;
}
