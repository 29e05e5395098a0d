//! Shared fixtures for tape offer tests.

#![allow(dead_code)]

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tapevault_core::config::AppConfig;
use tapevault_core::{DigestType, TapeCatalog};
use tapevault_device::SimulatedTapeLibrary;
use tapevault_metadata::{MetadataStore, SqliteStore};
use tapevault_offer::{
    AccessRequestManager, ArchiveCache, DriveWorker, InputFileEvent, OfferMetrics,
    SealedTarEvent, TapeLibraryStorage, TarBuilder, WriteOrderCreator,
};
use tapevault_storage::{ContentAddressableStorage, stream_from_bytes};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const CONTAINER: &str = "0_object";
pub const TAPE_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Offer components over a temporary directory and a simulated library
/// with tapes `TAPE01` (slot 1) and `TAPE02` (slot 2) and one drive.
pub struct Harness {
    pub config: AppConfig,
    pub store: Arc<dyn MetadataStore>,
    /// Same store, for tests that reach into the database.
    pub sqlite: Arc<SqliteStore>,
    pub metrics: Arc<OfferMetrics>,
    pub cache: Arc<ArchiveCache>,
    pub library: SimulatedTapeLibrary,
    _temp_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_drives(1).await
    }

    pub async fn with_drives(drives: u32) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let config = AppConfig::for_testing(temp_dir.path());
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("test.db"), Duration::from_secs(10), 4)
                .await
                .unwrap(),
        );
        let store: Arc<dyn MetadataStore> = sqlite.clone();
        for dir in [
            &config.storage.input_files_path,
            &config.storage.input_tars_path,
            &config.storage.tmp_tar_output_path,
        ] {
            std::fs::create_dir_all(dir).unwrap();
        }

        let library = SimulatedTapeLibrary::new(4, drives);
        for (slot, code) in [(1, "TAPE01"), (2, "TAPE02")] {
            library.insert_tape(slot, code);
            let mut tape = TapeCatalog::new(code, slot, TAPE_CAPACITY);
            tape.library = Some(config.library.name.clone());
            store.create_tape(&tape).await.unwrap();
        }

        let cache = Arc::new(
            ArchiveCache::open(
                &config.storage.cache_path,
                config.storage.cache_max_capacity,
            )
            .unwrap(),
        );
        Self {
            config,
            store,
            sqlite,
            metrics: Arc::new(OfferMetrics::new().unwrap()),
            cache,
            library,
            _temp_dir: temp_dir,
        }
    }

    pub fn builder(&self) -> (TarBuilder, mpsc::UnboundedReceiver<SealedTarEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let builder = TarBuilder::new(
            self.store.clone(),
            &self.config.storage,
            self.config.topology.clone(),
            tx,
            self.metrics.clone(),
        );
        (builder, rx)
    }

    pub fn write_orders(&self) -> WriteOrderCreator {
        WriteOrderCreator::new(self.store.clone(), self.metrics.clone())
    }

    pub fn access_requests(&self) -> Arc<AccessRequestManager> {
        Arc::new(AccessRequestManager::new(
            self.store.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            self.config.access_request.clone(),
        ))
    }

    pub fn storage(&self) -> (TapeLibraryStorage, mpsc::UnboundedReceiver<InputFileEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let storage = TapeLibraryStorage::new(
            self.store.clone(),
            &self.config.storage,
            self.config.topology.clone(),
            self.cache.clone(),
            self.access_requests(),
            tx,
        );
        (storage, rx)
    }

    pub fn worker(&self, drive: u32) -> DriveWorker {
        DriveWorker::new(
            self.library.drive_handle(drive),
            Arc::new(self.library.robot()),
            self.store.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            &self.config,
        )
    }

    /// Empty the archive cache, as after losing the cache disk.
    pub fn wipe_cache(&mut self) {
        std::fs::remove_dir_all(&self.config.storage.cache_path).unwrap();
        self.cache = Arc::new(
            ArchiveCache::open(
                &self.config.storage.cache_path,
                self.config.storage.cache_max_capacity,
            )
            .unwrap(),
        );
    }
}

/// Write an object through the offer and return its digest.
pub async fn put(storage: &TapeLibraryStorage, name: &str, data: &[u8]) -> String {
    storage
        .write_object(
            CONTAINER,
            name,
            stream_from_bytes(Bytes::copy_from_slice(data)),
            DigestType::Sha512,
            data.len() as u64,
        )
        .await
        .unwrap()
}

/// Pack every pending input event and seal the TARs.
pub async fn pack_all(
    builder: &mut TarBuilder,
    inputs: &mut mpsc::UnboundedReceiver<InputFileEvent>,
    sealed: &mut mpsc::UnboundedReceiver<SealedTarEvent>,
) -> Vec<SealedTarEvent> {
    while let Ok(event) = inputs.try_recv() {
        builder.handle(event).await;
    }
    builder.seal_all().await.unwrap();
    let mut events = Vec::new();
    while let Ok(event) = sealed.try_recv() {
        events.push(event);
    }
    events
}
