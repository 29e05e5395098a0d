//! Shared fixtures for metadata store tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tapevault_core::{QueueMessage, QueueOrder, ReadOrder, WriteOrder};
use tapevault_metadata::{MetadataResult, MetadataStore, SqliteStore};
use tempfile::TempDir;

/// A test metadata store wrapper that cleans up on drop.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, Duration::from_secs(10), 4).await?;

        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

pub fn write_order(bucket: &str, file_bucket_id: &str, archive_id: &str) -> WriteOrder {
    WriteOrder {
        bucket: bucket.to_string(),
        file_bucket_id: file_bucket_id.to_string(),
        file_path: format!("/inputTars/{file_bucket_id}/{archive_id}"),
        size: 1024,
        digest: "d".repeat(128),
        archive_id: archive_id.to_string(),
    }
}

pub fn write_message(bucket: &str, archive_id: &str) -> QueueMessage {
    QueueMessage::new(QueueOrder::WriteOrder(write_order(bucket, "objects", archive_id)))
}

pub fn read_message(tape_code: &str, archive_id: &str, position: u32) -> QueueMessage {
    QueueMessage::new(QueueOrder::ReadOrder(ReadOrder {
        tape_code: tape_code.to_string(),
        file_position: position,
        file_name: archive_id.to_string(),
        bucket: "default".to_string(),
        file_bucket_id: "objects".to_string(),
        size: 1024,
    }))
}

pub fn archive_id(order: &QueueOrder) -> &str {
    match order {
        QueueOrder::WriteOrder(o) | QueueOrder::WriteBackupOrder(o) => &o.archive_id,
        QueueOrder::ReadOrder(o) => &o.file_name,
    }
}
