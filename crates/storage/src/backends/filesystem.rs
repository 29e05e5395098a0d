//! Plain-directory disk offer.
//!
//! Objects live at `{root}/{container}/{object_name}`. The digest recorded by
//! `check_object_digest_and_store_digest` is kept in a hidden sidecar next to
//! the object, `.{object_name}.digest`.

use crate::error::{StorageError, StorageResult};
use crate::persist::{digest_path, not_found_as, persist_stream, validate_name};
use crate::traits::{
    ContainerInformation, ContentAddressableStorage, ObjectContent, ObjectEntry,
    ObjectEntryStream, StorageMetadata, ByteStream,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tapevault_core::DigestType;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{instrument, warn};

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct StoredDigest {
    digest_type: DigestType,
    digest: String,
}

/// Disk offer without staging.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn container_path(&self, container: &str) -> StorageResult<PathBuf> {
        validate_name(container)?;
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, object_name: &str) -> StorageResult<PathBuf> {
        validate_name(object_name)?;
        Ok(self.container_path(container)?.join(object_name))
    }

    fn digest_path(&self, container: &str, object_name: &str) -> StorageResult<PathBuf> {
        Ok(self
            .container_path(container)?
            .join(format!(".{object_name}.digest")))
    }

    async fn stored_digest(&self, container: &str, object_name: &str) -> Option<StoredDigest> {
        let path = self.digest_path(container, object_name).ok()?;
        let raw = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(container, object_name, error = %e, "ignoring unreadable digest sidecar");
                None
            }
        }
    }

    async fn store_digest(
        &self,
        container: &str,
        object_name: &str,
        stored: &StoredDigest,
    ) -> StorageResult<()> {
        let path = self.digest_path(container, object_name)?;
        let raw = serde_json::to_vec(stored).map_err(|e| StorageError::Server(e.to_string()))?;
        let size = raw.len() as u64;
        persist_stream(
            &path,
            crate::traits::stream_from_bytes(Bytes::from(raw)),
            DigestType::Sha256,
            size,
            object_name,
        )
        .await?;
        Ok(())
    }

    async fn remove_digest(&self, container: &str, object_name: &str) -> StorageResult<()> {
        let path = self.digest_path(container, object_name)?;
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ContentAddressableStorage for FilesystemStorage {
    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn create_container(&self, container: &str) -> StorageResult<()> {
        fs::create_dir_all(self.container_path(container)?).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn is_existing_container(&self, container: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.container_path(container)?).await?)
    }

    #[instrument(skip(self, input), fields(offer = "filesystem"))]
    async fn write_object(
        &self,
        container: &str,
        object_name: &str,
        input: ByteStream,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<String> {
        let path = self.object_path(container, object_name)?;
        let digest = persist_stream(&path, input, digest_type, size, object_name).await?;
        self.remove_digest(container, object_name).await?;
        Ok(digest)
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn check_object_digest_and_store_digest(
        &self,
        container: &str,
        object_name: &str,
        object_digest: &str,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<()> {
        let path = self.object_path(container, object_name)?;
        let (actual, actual_size) = digest_path(&path, digest_type)
            .await
            .map_err(|e| match e {
                StorageError::Io(io) => not_found_as(object_name)(io),
                other => other,
            })?;
        if actual != object_digest || actual_size != size {
            return Err(StorageError::Corruption {
                object: format!("{container}/{object_name}"),
                expected: object_digest.to_string(),
                actual,
            });
        }
        self.store_digest(
            container,
            object_name,
            &StoredDigest {
                digest_type,
                digest: actual,
            },
        )
        .await
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn get_object(&self, container: &str, object_name: &str) -> StorageResult<ObjectContent> {
        let path = self.object_path(container, object_name)?;
        let file = fs::File::open(&path).await.map_err(not_found_as(object_name))?;
        let size = file.metadata().await?.len();

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
        Ok(ObjectContent {
            size,
            stream: Box::pin(stream),
        })
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn delete_object(&self, container: &str, object_name: &str) -> StorageResult<()> {
        let path = self.object_path(container, object_name)?;
        fs::remove_file(&path).await.map_err(not_found_as(object_name))?;
        self.remove_digest(container, object_name).await
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn is_existing_object(&self, container: &str, object_name: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.object_path(container, object_name)?).await?)
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn get_object_digest(
        &self,
        container: &str,
        object_name: &str,
        digest_type: DigestType,
        no_cache: bool,
    ) -> StorageResult<String> {
        let path = self.object_path(container, object_name)?;
        if !no_cache
            && let Some(stored) = self.stored_digest(container, object_name).await
            && stored.digest_type == digest_type
            && fs::try_exists(&path).await?
        {
            return Ok(stored.digest);
        }
        let (digest, _) = digest_path(&path, digest_type).await.map_err(|e| match e {
            StorageError::Io(io) => not_found_as(object_name)(io),
            other => other,
        })?;
        Ok(digest)
    }

    async fn get_container_information(
        &self,
        container: &str,
    ) -> StorageResult<ContainerInformation> {
        let path = self.container_path(container)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(container.to_string()));
        }
        Ok(ContainerInformation { usable_space: -1 })
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn get_object_metadata(
        &self,
        container: &str,
        object_name: &str,
        no_cache: bool,
    ) -> StorageResult<StorageMetadata> {
        let path = self.object_path(container, object_name)?;
        let meta = fs::metadata(&path).await.map_err(not_found_as(object_name))?;
        let digest_type = match self.stored_digest(container, object_name).await {
            Some(stored) => stored.digest_type,
            None => DigestType::default(),
        };
        let digest = self
            .get_object_digest(container, object_name, digest_type, no_cache)
            .await?;
        Ok(StorageMetadata {
            object_name: object_name.to_string(),
            container: container.to_string(),
            digest,
            digest_type,
            size: meta.len(),
            last_modified: meta.modified().ok().map(OffsetDateTime::from),
        })
    }

    #[instrument(skip(self), fields(offer = "filesystem"))]
    async fn list_container(&self, container: &str) -> StorageResult<ObjectEntryStream> {
        let path = self.container_path(container)?;
        let exists = fs::try_exists(&path).await?;

        let stream = async_stream::try_stream! {
            if !exists {
                return;
            }
            let mut entries = fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                // Symlinks are not followed.
                let file_type = entry.file_type().await?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !file_type.is_file() || validate_name(&name).is_err() {
                    continue;
                }
                let size = entry.metadata().await?.len();
                yield ObjectEntry { object_name: name, size };
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{check_availability, collect_stream, stream_from_bytes};
    use futures::TryStreamExt;

    async fn store() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    async fn put(storage: &FilesystemStorage, name: &str, data: &'static [u8]) -> String {
        storage
            .write_object(
                "c",
                name,
                stream_from_bytes(Bytes::from_static(data)),
                DigestType::Sha512,
                data.len() as u64,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_verify_read() {
        let (_dir, storage) = store().await;
        storage.create_container("c").await.unwrap();
        assert!(storage.is_existing_container("c").await.unwrap());

        let digest = put(&storage, "obj1", b"payload").await;
        assert_eq!(digest, DigestType::Sha512.digest_bytes(b"payload"));
        storage
            .check_object_digest_and_store_digest("c", "obj1", &digest, DigestType::Sha512, 7)
            .await
            .unwrap();

        let content = storage.get_object("c", "obj1").await.unwrap();
        assert_eq!(content.size, 7);
        assert_eq!(&collect_stream(content.stream).await.unwrap()[..], b"payload");

        let meta = storage.get_object_metadata("c", "obj1", false).await.unwrap();
        assert_eq!(meta.digest, digest);
        assert_eq!(meta.size, 7);
    }

    #[tokio::test]
    async fn test_storage_side_corruption_detected() {
        let (dir, storage) = store().await;
        let digest = put(&storage, "obj1", b"payload").await;
        std::fs::write(dir.path().join("c/obj1"), b"paylOad").unwrap();

        let err = storage
            .check_object_digest_and_store_digest("c", "obj1", &digest, DigestType::Sha512, 7)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_digest_cache_and_no_cache() {
        let (dir, storage) = store().await;
        let digest = put(&storage, "obj1", b"abc").await;
        storage
            .check_object_digest_and_store_digest("c", "obj1", &digest, DigestType::Sha512, 3)
            .await
            .unwrap();
        std::fs::write(dir.path().join("c/obj1"), b"xyz").unwrap();

        let cached = storage
            .get_object_digest("c", "obj1", DigestType::Sha512, false)
            .await
            .unwrap();
        assert_eq!(cached, digest);
        let fresh = storage
            .get_object_digest("c", "obj1", DigestType::Sha512, true)
            .await
            .unwrap();
        assert_eq!(fresh, DigestType::Sha512.digest_bytes(b"xyz"));
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let (_dir, storage) = store().await;
        put(&storage, "obj1", b"abc").await;
        storage.delete_object("c", "obj1").await.unwrap();
        assert!(!storage.is_existing_object("c", "obj1").await.unwrap());
        assert!(matches!(
            storage.delete_object("c", "obj1").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.get_object("c", "obj1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_skips_sidecars() {
        let (_dir, storage) = store().await;
        let digest = put(&storage, "a", b"1").await;
        put(&storage, "b", b"22").await;
        storage
            .check_object_digest_and_store_digest("c", "a", &digest, DigestType::Sha512, 1)
            .await
            .unwrap();

        let mut listed: Vec<ObjectEntry> = storage
            .list_container("c")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        listed.sort_by(|x, y| x.object_name.cmp(&y.object_name));
        assert_eq!(
            listed,
            vec![
                ObjectEntry { object_name: "a".into(), size: 1 },
                ObjectEntry { object_name: "b".into(), size: 2 },
            ]
        );
        let empty: Vec<ObjectEntry> = storage
            .list_container("missing")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_async_surface_unsupported_means_available() {
        let (_dir, storage) = store().await;
        let names = vec!["a".to_string()];
        assert!(
            storage
                .create_access_request("c", &names)
                .await
                .unwrap_err()
                .is_unsupported()
        );
        assert!(check_availability(&storage, "c", &names).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let (_dir, storage) = store().await;
        for name in ["../x", "a/b", ".hidden", ""] {
            assert!(matches!(
                storage.is_existing_object("c", name).await,
                Err(StorageError::InvalidName(_))
            ));
        }
    }
}
