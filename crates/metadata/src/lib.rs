//! Persistent state of the tape offer.
//!
//! This crate provides the control-plane data model:
//! - Tape catalog with versioned cartridge documents
//! - Work queue with atomic, priority-aware claims
//! - Archive referential (where each TAR lives)
//! - Object referential (which TAR entries hold each object)
//! - Access requests gating reads of tape-resident data

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use std::time::Duration;
use tapevault_core::config::MetadataConfig;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
            max_connections,
        } => {
            let store = SqliteStore::new(
                path,
                Duration::from_secs(*busy_timeout_secs),
                *max_connections,
            )
            .await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("tapevault.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            busy_timeout_secs: 5,
            max_connections: 2,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        store.migrate().await.unwrap();
        assert!(db_path.exists());
    }
}
