//! Content-addressable storage surface shared by all offers.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tapevault_core::{AccessRequestId, AccessRequestStatus, DigestType};
use time::OffsetDateTime;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of container entries.
pub type ObjectEntryStream = Pin<Box<dyn Stream<Item = StorageResult<ObjectEntry>> + Send>>;

/// Wrap in-memory bytes as a single-chunk stream.
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Object content with its size.
pub struct ObjectContent {
    pub size: u64,
    pub stream: ByteStream,
}

impl std::fmt::Debug for ObjectContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectContent")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Space information for a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInformation {
    /// Usable bytes, `-1` when the offer cannot tell.
    pub usable_space: i64,
}

/// Stored object description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub object_name: String,
    pub container: String,
    pub digest: String,
    pub digest_type: DigestType,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
}

/// One entry of a container listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub object_name: String,
    pub size: u64,
}

/// Storage offer addressed by (container, object name).
///
/// The last four operations form the asynchronous staging surface. Offers
/// whose objects are always readable keep the default `Unsupported`
/// implementations; callers must read that as "immediately available"
/// (see [`check_availability`]).
#[async_trait]
pub trait ContentAddressableStorage: Send + Sync {
    async fn create_container(&self, container: &str) -> StorageResult<()>;

    async fn is_existing_container(&self, container: &str) -> StorageResult<bool>;

    /// Store `size` bytes from `input` and return their digest.
    ///
    /// A stream delivering a different number of bytes fails with
    /// [`StorageError::TransferCorrupted`].
    async fn write_object(
        &self,
        container: &str,
        object_name: &str,
        input: ByteStream,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<String>;

    /// Re-read the stored object and compare it to the digest computed while
    /// writing. A mismatch is [`StorageError::Corruption`].
    async fn check_object_digest_and_store_digest(
        &self,
        container: &str,
        object_name: &str,
        object_digest: &str,
        digest_type: DigestType,
        size: u64,
    ) -> StorageResult<()>;

    /// Object content, or [`StorageError::Unavailable`] when it must be staged first.
    async fn get_object(&self, container: &str, object_name: &str) -> StorageResult<ObjectContent>;

    async fn delete_object(&self, container: &str, object_name: &str) -> StorageResult<()>;

    async fn is_existing_object(&self, container: &str, object_name: &str) -> StorageResult<bool>;

    async fn get_object_digest(
        &self,
        container: &str,
        object_name: &str,
        digest_type: DigestType,
        no_cache: bool,
    ) -> StorageResult<String>;

    async fn get_container_information(
        &self,
        container: &str,
    ) -> StorageResult<ContainerInformation>;

    async fn get_object_metadata(
        &self,
        container: &str,
        object_name: &str,
        no_cache: bool,
    ) -> StorageResult<StorageMetadata>;

    async fn list_container(&self, container: &str) -> StorageResult<ObjectEntryStream>;

    async fn create_access_request(
        &self,
        _container: &str,
        _object_names: &[String],
    ) -> StorageResult<AccessRequestId> {
        Err(StorageError::Unsupported("create_access_request"))
    }

    async fn check_access_request_statuses(
        &self,
        _ids: &[AccessRequestId],
    ) -> StorageResult<HashMap<AccessRequestId, AccessRequestStatus>> {
        Err(StorageError::Unsupported("check_access_request_statuses"))
    }

    async fn remove_access_request(&self, _id: &AccessRequestId) -> StorageResult<()> {
        Err(StorageError::Unsupported("remove_access_request"))
    }

    async fn check_object_availability(
        &self,
        _container: &str,
        _object_names: &[String],
    ) -> StorageResult<bool> {
        Err(StorageError::Unsupported("check_object_availability"))
    }
}

/// Whether every object can be read without staging. Offers without a
/// staging surface always answer `true`.
pub async fn check_availability(
    storage: &dyn ContentAddressableStorage,
    container: &str,
    object_names: &[String],
) -> StorageResult<bool> {
    match storage.check_object_availability(container, object_names).await {
        Err(StorageError::Unsupported(_)) => Ok(true),
        other => other,
    }
}

/// Drain a byte stream into memory.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    use futures::StreamExt;

    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(data))
}
