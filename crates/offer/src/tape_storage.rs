//! Content-addressable storage backed by the tape library.
//!
//! Writes land in the input files directory and are packed into TARs in the
//! background. Reads are served from wherever the bytes currently are: the
//! input file, a TAR still on disk, or a TAR staged into the archive cache.
//! Objects whose TARs are on tape only answer [`StorageError::Unavailable`]
//! until an access request stages them.

use crate::access_request::AccessRequestManager;
use crate::archive_cache::ArchiveCache;
use crate::error::OfferError;
use crate::input_files::InputFileStorage;
use crate::tar_builder::InputFileEvent;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tapevault_core::config::{StorageConfig, TopologyConfig};
use tapevault_core::{AccessRequestId, AccessRequestStatus, DigestType, ObjectLocation};
use tapevault_metadata::models::ObjectRow;
use tapevault_metadata::{MetadataError, MetadataStore};
use tapevault_storage::persist::validate_name;
use tapevault_storage::tar::stream_entries;
use tapevault_storage::{
    ByteStream, ContainerInformation, ContentAddressableStorage, ObjectContent,
    ObjectEntryStream, StorageError, StorageMetadata, StorageResult,
};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Chunk size for streaming input files (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

fn metadata_error(e: MetadataError) -> StorageError {
    OfferError::from(e).into()
}

/// Tape offer.
pub struct TapeLibraryStorage {
    store: Arc<dyn MetadataStore>,
    input_files: InputFileStorage,
    input_tars_path: PathBuf,
    topology: TopologyConfig,
    cache: Arc<ArchiveCache>,
    access_requests: Arc<AccessRequestManager>,
    input_tx: mpsc::UnboundedSender<InputFileEvent>,
}

impl TapeLibraryStorage {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: &StorageConfig,
        topology: TopologyConfig,
        cache: Arc<ArchiveCache>,
        access_requests: Arc<AccessRequestManager>,
        input_tx: mpsc::UnboundedSender<InputFileEvent>,
    ) -> Self {
        Self {
            store,
            input_files: InputFileStorage::new(&storage.input_files_path),
            input_tars_path: storage.input_tars_path.clone(),
            topology,
            cache,
            access_requests,
            input_tx,
        }
    }

    async fn object(&self, container: &str, object_name: &str) -> StorageResult<ObjectRow> {
        validate_name(container)?;
        validate_name(object_name)?;
        self.store
            .find_object(container, object_name)
            .await
            .map_err(metadata_error)?
            .ok_or_else(|| StorageError::NotFound(format!("{container}/{object_name}")))
    }

    /// Readable path of a TAR, or `Unavailable` when it is on tape only.
    async fn archive_path(&self, tar_id: &str, object: &str) -> StorageResult<PathBuf> {
        let archive = self
            .store
            .find_archive(tar_id)
            .await
            .map_err(metadata_error)?
            .ok_or_else(|| StorageError::Server(format!("archive {tar_id} is missing")))?;
        if archive.location().map_err(metadata_error)?.is_on_disk() {
            let path = self
                .input_tars_path
                .join(&archive.file_bucket_id)
                .join(tar_id);
            if tokio::fs::try_exists(&path).await? {
                return Ok(path);
            }
        }
        // Written to tape meanwhile, maybe kept in the cache.
        self.cache
            .try_read(&archive.file_bucket_id, tar_id)
            .ok_or_else(|| StorageError::Unavailable(object.to_string()))
    }

    /// Stream the object content. `None` when its input file was packed and
    /// removed since `row` was read.
    async fn open(&self, row: &ObjectRow) -> StorageResult<Option<ByteStream>> {
        let object = format!("{}/{}", row.container, row.object_name);
        match row.location().map_err(metadata_error)? {
            ObjectLocation::InputFile => {
                let path = self.input_files.path(&row.container, &row.storage_id);
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let stream = async_stream::try_stream! {
                    let mut file = file;
                    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
                    loop {
                        let n = file.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        yield Bytes::copy_from_slice(&buf[..n]);
                    }
                };
                Ok(Some(Box::pin(stream)))
            }
            ObjectLocation::Tar { entries } => {
                let mut sources = Vec::with_capacity(entries.len());
                for entry in entries {
                    let path = self.archive_path(&entry.tar_id, &object).await?;
                    sources.push((path, entry));
                }
                Ok(Some(stream_entries(object, sources)))
            }
        }
    }

    /// Open the object, reloading its row once if it was packed meanwhile.
    async fn open_current(
        &self,
        container: &str,
        object_name: &str,
    ) -> StorageResult<(ObjectRow, ByteStream)> {
        let row = self.object(container, object_name).await?;
        if let Some(stream) = self.open(&row).await? {
            return Ok((row, stream));
        }
        let row = self.object(container, object_name).await?;
        match self.open(&row).await? {
            Some(stream) => Ok((row, stream)),
            None => Err(StorageError::NotFound(format!("{container}/{object_name}"))),
        }
    }

    /// Digest of the stored bytes. Objects on tape only keep the digest
    /// recorded when their entries were written.
    async fn compute_digest(
        &self,
        container: &str,
        object_name: &str,
    ) -> StorageResult<(ObjectRow, String, u64)> {
        let (row, mut stream) = match self.open_current(container, object_name).await {
            Err(StorageError::Unavailable(_)) => {
                let row = self.object(container, object_name).await?;
                let (digest, size) = (row.digest.clone(), row.size());
                return Ok((row, digest, size));
            }
            other => other?,
        };
        let mut digester = row.digest_type().map_err(metadata_error)?.digester();
        while let Some(chunk) = stream.next().await {
            digester.update(&chunk?);
        }
        let size = digester.bytes_digested();
        Ok((row, digester.finalize_hex(), size))
    }
}

#[async_trait]
impl ContentAddressableStorage for TapeLibraryStorage {
    async fn create_container(&self, container: &str) -> StorageResult<()> {
        validate_name(container)
    }

    async fn is_existing_container(&self, container: &str) -> StorageResult<bool> {
        validate_name(container)?;
        Ok(true)
    }

    #[instrument(skip(self, input), fields(offer = "tape"))]
    async fn write_object(
        &self,
        container: &str,
        object_name: &str,
        input: ByteStream,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<String> {
        validate_name(container)?;
        validate_name(object_name)?;
        let (bucket, file_bucket_id) = self.topology.resolve(container).ok_or_else(|| {
            StorageError::Server(format!("container {container} has no file bucket"))
        })?;

        let storage_id = uuid::Uuid::new_v4().to_string();
        let digest = self
            .input_files
            .write(container, &storage_id, object_name, input, digest_type, size)
            .await?;

        let previous = self
            .store
            .find_object(container, object_name)
            .await
            .map_err(metadata_error)?;
        let row = ObjectRow::new(
            container,
            object_name,
            &storage_id,
            size,
            &digest,
            digest_type,
            &ObjectLocation::InputFile,
        )
        .map_err(metadata_error)?;
        self.store.upsert_object(&row).await.map_err(metadata_error)?;

        if let Some(previous) = previous
            && matches!(previous.location(), Ok(ObjectLocation::InputFile))
            && let Err(e) = self.input_files.remove(container, &previous.storage_id).await
        {
            warn!(container, object_name, error = %e, "Could not remove replaced input file");
        }

        let event = InputFileEvent {
            container: container.to_string(),
            object_name: object_name.to_string(),
            storage_id,
            size,
            digest_type,
            bucket: bucket.to_string(),
            file_bucket_id: file_bucket_id.to_string(),
        };
        if self.input_tx.send(event).is_err() {
            // Picked up from the object referential on the next start.
            warn!(container, object_name, "TAR builder is not running");
        }
        Ok(digest)
    }

    #[instrument(skip(self), fields(offer = "tape"))]
    async fn check_object_digest_and_store_digest(
        &self,
        container: &str,
        object_name: &str,
        object_digest: &str,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<()> {
        let object = format!("{container}/{object_name}");
        let row = self.object(container, object_name).await?;
        if row.digest_type().map_err(metadata_error)? != digest_type
            || row.digest != object_digest
            || row.size() != size
        {
            return Err(StorageError::Corruption {
                object,
                expected: object_digest.to_string(),
                actual: row.digest,
            });
        }

        let (_, actual, actual_size) = self.compute_digest(container, object_name).await?;
        if actual != object_digest || actual_size != size {
            return Err(StorageError::Corruption {
                object,
                expected: object_digest.to_string(),
                actual,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(offer = "tape"))]
    async fn get_object(&self, container: &str, object_name: &str) -> StorageResult<ObjectContent> {
        let (row, stream) = self.open_current(container, object_name).await?;
        Ok(ObjectContent {
            size: row.size(),
            stream,
        })
    }

    #[instrument(skip(self), fields(offer = "tape"))]
    async fn delete_object(&self, container: &str, object_name: &str) -> StorageResult<()> {
        let row = self.object(container, object_name).await?;
        self.store
            .delete_object(container, object_name)
            .await
            .map_err(metadata_error)?;
        // Entries already packed stay in their TAR.
        if matches!(row.location(), Ok(ObjectLocation::InputFile)) {
            self.input_files.remove(container, &row.storage_id).await?;
        }
        debug!(container, object_name, "Object deleted");
        Ok(())
    }

    async fn is_existing_object(&self, container: &str, object_name: &str) -> StorageResult<bool> {
        match self.object(container, object_name).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(offer = "tape"))]
    async fn get_object_digest(
        &self,
        container: &str,
        object_name: &str,
        digest_type: DigestType,
        no_cache: bool,
    ) -> StorageResult<String> {
        let row = self.object(container, object_name).await?;
        if row.digest_type().map_err(metadata_error)? != digest_type {
            return Err(StorageError::NotFound(format!(
                "{container}/{object_name} has no {digest_type} digest"
            )));
        }
        if !no_cache {
            return Ok(row.digest);
        }
        let (_, digest, _) = self.compute_digest(container, object_name).await?;
        Ok(digest)
    }

    async fn get_container_information(
        &self,
        container: &str,
    ) -> StorageResult<ContainerInformation> {
        validate_name(container)?;
        Ok(ContainerInformation { usable_space: -1 })
    }

    async fn get_object_metadata(
        &self,
        container: &str,
        object_name: &str,
        no_cache: bool,
    ) -> StorageResult<StorageMetadata> {
        let row = self.object(container, object_name).await?;
        let digest_type = row.digest_type().map_err(metadata_error)?;
        let digest = if no_cache {
            self.compute_digest(container, object_name).await?.1
        } else {
            row.digest.clone()
        };
        Ok(StorageMetadata {
            object_name: row.object_name.clone(),
            container: row.container.clone(),
            digest,
            digest_type,
            size: row.size(),
            last_modified: Some(row.updated_at),
        })
    }

    async fn list_container(&self, _container: &str) -> StorageResult<ObjectEntryStream> {
        Err(StorageError::Unsupported("list_container"))
    }

    async fn create_access_request(
        &self,
        container: &str,
        object_names: &[String],
    ) -> StorageResult<AccessRequestId> {
        Ok(self.access_requests.create(container, object_names).await?)
    }

    async fn check_access_request_statuses(
        &self,
        ids: &[AccessRequestId],
    ) -> StorageResult<HashMap<AccessRequestId, AccessRequestStatus>> {
        Ok(self.access_requests.statuses(ids).await?)
    }

    async fn remove_access_request(&self, id: &AccessRequestId) -> StorageResult<()> {
        Ok(self.access_requests.remove(id).await?)
    }

    async fn check_object_availability(
        &self,
        container: &str,
        object_names: &[String],
    ) -> StorageResult<bool> {
        Ok(self
            .access_requests
            .check_object_availability(container, object_names)
            .await?)
    }
}
