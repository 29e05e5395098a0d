//! Object referential.

use crate::error::MetadataResult;
use crate::models::ObjectRow;
use async_trait::async_trait;
use tapevault_core::TarEntryDescription;

#[async_trait]
pub trait ObjectReferentialRepo: Send + Sync {
    /// Insert or overwrite the object (a rewrite replaces the previous write).
    async fn upsert_object(&self, object: &ObjectRow) -> MetadataResult<()>;

    async fn find_object(
        &self,
        container: &str,
        object_name: &str,
    ) -> MetadataResult<Option<ObjectRow>>;

    async fn find_objects(
        &self,
        container: &str,
        object_names: &[String],
    ) -> MetadataResult<Vec<ObjectRow>>;

    /// Point the object at its TAR entries, but only if it was not rewritten
    /// since `storage_id` was assigned.
    async fn update_to_tar_location(
        &self,
        container: &str,
        object_name: &str,
        storage_id: &str,
        entries: &[TarEntryDescription],
    ) -> MetadataResult<bool>;

    async fn delete_object(&self, container: &str, object_name: &str) -> MetadataResult<bool>;

    /// Objects still waiting in the input files directory, oldest write first.
    async fn list_input_file_objects(&self) -> MetadataResult<Vec<ObjectRow>>;
}
