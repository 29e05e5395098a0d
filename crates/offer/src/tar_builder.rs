//! Packing of input files into TAR containers.
//!
//! One TAR is open per file bucket at a time. Input file events are handled
//! strictly in arrival order by a single task, so entries land in the TAR in
//! the order objects were written. Objects larger than the maximum entry size
//! are split into several consecutive entries, possibly across TARs.
//!
//! An object's referential entry is switched to its TAR entries only after
//! every entry is durable. A TAR is sealed when the next entry would not fit
//! or after it has been idle for the seal timeout; sealing emits a
//! [`SealedTarEvent`] for the write order pipeline.

use crate::error::{OfferError, OfferResult};
use crate::input_files::{InputFileStorage, remove_if_exists};
use crate::metrics::OfferMetrics;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapevault_core::config::{StorageConfig, TopologyConfig};
use tapevault_core::{ArchiveLocationType, DigestType, TarEntryDescription};
use tapevault_metadata::MetadataStore;
use tapevault_metadata::models::ArchiveRow;
use tapevault_storage::TarAppender;
use tapevault_storage::tar::{discard_index, index_path};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Digest algorithm of whole sealed TARs.
pub const TAR_DIGEST_TYPE: DigestType = DigestType::Sha512;

/// An object durably written to the input files directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFileEvent {
    pub container: String,
    pub object_name: String,
    pub storage_id: String,
    pub size: u64,
    pub digest_type: DigestType,
    pub bucket: String,
    pub file_bucket_id: String,
}

/// A TAR sealed on disk and ready to be written to tape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedTarEvent {
    pub archive_id: String,
    pub bucket: String,
    pub file_bucket_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub digest: String,
}

struct BuildingTar {
    appender: TarAppender,
    bucket: String,
    file_bucket_id: String,
    last_append: Instant,
}

/// New TAR identifier: creation time then a random suffix.
pub fn new_tar_id() -> String {
    let format =
        format_description!("[year][month][day][hour][minute][second][subsecond digits:3]");
    let timestamp = OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string());
    format!("{timestamp}-{}.tar", uuid::Uuid::new_v4())
}

/// Builds TARs from input files, one open TAR per file bucket.
pub struct TarBuilder {
    store: Arc<dyn MetadataStore>,
    input_files: InputFileStorage,
    input_tars_path: PathBuf,
    topology: TopologyConfig,
    max_entry_size: u64,
    max_tar_size: u64,
    seal_timeout: Duration,
    sealed_tx: mpsc::UnboundedSender<SealedTarEvent>,
    metrics: Arc<OfferMetrics>,
    building: HashMap<String, BuildingTar>,
}

impl TarBuilder {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: &StorageConfig,
        topology: TopologyConfig,
        sealed_tx: mpsc::UnboundedSender<SealedTarEvent>,
        metrics: Arc<OfferMetrics>,
    ) -> Self {
        Self {
            store,
            input_files: InputFileStorage::new(&storage.input_files_path),
            input_tars_path: storage.input_tars_path.clone(),
            topology,
            max_entry_size: storage.max_tar_entry_size,
            max_tar_size: storage.max_tar_file_size,
            seal_timeout: storage.tar_seal_timeout(),
            sealed_tx,
            metrics,
            building: HashMap::new(),
        }
    }

    pub fn tar_path(&self, file_bucket_id: &str, tar_id: &str) -> PathBuf {
        self.input_tars_path.join(file_bucket_id).join(tar_id)
    }

    /// Reconcile disk and referential after a restart.
    ///
    /// TARs still marked as building are truncated to their last durable
    /// entry and sealed (or dropped when empty). Objects still waiting in the
    /// input files directory are then packed again.
    pub async fn recover(&mut self) -> OfferResult<()> {
        let building = self
            .store
            .list_archives_by_location(ArchiveLocationType::BuildingOnDisk)
            .await?;
        for archive in building {
            let path = self.tar_path(&archive.file_bucket_id, &archive.archive_id);
            if !tokio::fs::try_exists(&path).await? {
                warn!(tar_id = %archive.archive_id, "Building TAR missing on disk, forgetting it");
                remove_if_exists(&index_path(&path)).await?;
                self.store.delete_archive(&archive.archive_id).await?;
                continue;
            }
            let tar_id = archive.archive_id.clone();
            let max_size = self.max_tar_size;
            let appender = tokio::task::spawn_blocking(move || {
                TarAppender::recover(path, tar_id, max_size)
            })
            .await??;
            self.seal(BuildingTar {
                appender,
                bucket: archive.bucket,
                file_bucket_id: archive.file_bucket_id,
                last_append: Instant::now(),
            })
            .await?;
        }

        let pending = self.store.list_input_file_objects().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Packing input files left by a previous run");
        }
        for object in pending {
            let Some((bucket, file_bucket_id)) = self.topology.resolve(&object.container) else {
                warn!(
                    container = %object.container,
                    object = %object.object_name,
                    "No file bucket for container, input file left in place"
                );
                continue;
            };
            let event = InputFileEvent {
                container: object.container.clone(),
                object_name: object.object_name.clone(),
                storage_id: object.storage_id.clone(),
                size: object.size(),
                digest_type: object.digest_type()?,
                bucket: bucket.to_string(),
                file_bucket_id: file_bucket_id.to_string(),
            };
            self.handle(event).await;
        }
        Ok(())
    }

    /// Process events until the channel closes or shutdown is signalled.
    ///
    /// TARs still open at shutdown are left building; [`recover`](Self::recover)
    /// seals them on the next start.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<InputFileEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let deadline = self.next_seal_deadline();
            let idle = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = idle => {
                    if let Err(e) = self.seal_idle().await {
                        error!(error = %e, "Failed to seal idle TAR");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(open = self.building.len(), "TAR builder stopped");
    }

    fn next_seal_deadline(&self) -> Option<Instant> {
        self.building
            .values()
            .map(|tar| tar.last_append + self.seal_timeout)
            .min()
    }

    /// Seal every TAR idle for at least the seal timeout.
    pub async fn seal_idle(&mut self) -> OfferResult<()> {
        let now = Instant::now();
        let idle: Vec<String> = self
            .building
            .iter()
            .filter(|(_, tar)| tar.last_append + self.seal_timeout <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for file_bucket_id in idle {
            if let Some(tar) = self.building.remove(&file_bucket_id) {
                self.seal(tar).await?;
            }
        }
        Ok(())
    }

    /// Seal every open TAR regardless of idle time.
    pub async fn seal_all(&mut self) -> OfferResult<()> {
        let ids: Vec<String> = self.building.keys().cloned().collect();
        for file_bucket_id in ids {
            if let Some(tar) = self.building.remove(&file_bucket_id) {
                self.seal(tar).await?;
            }
        }
        Ok(())
    }

    /// Pack one input file. Failures are logged; the object stays in the
    /// input files directory and is retried on the next start.
    pub async fn handle(&mut self, event: InputFileEvent) {
        if let Err(e) = self.append_object(&event).await {
            match e {
                OfferError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    debug!(
                        container = %event.container,
                        object = %event.object_name,
                        "Input file gone before packing, skipping"
                    );
                }
                other => error!(
                    container = %event.container,
                    object = %event.object_name,
                    error = %other,
                    "Failed to pack input file"
                ),
            }
        }
    }

    async fn append_object(&mut self, event: &InputFileEvent) -> OfferResult<()> {
        let source = self.input_files.path(&event.container, &event.storage_id);
        let mut entries: Vec<TarEntryDescription> = Vec::new();
        let mut offset = 0u64;
        let mut segment = 0u32;
        // An empty object still gets one (empty) entry.
        while offset < event.size || (event.size == 0 && entries.is_empty()) {
            let size = (event.size - offset).min(self.max_entry_size);
            let entry_name = format!("{}/{}-{segment}", event.container, event.storage_id);
            let entry = self
                .append_segment(event, source.clone(), entry_name, offset, size)
                .await?;
            entries.push(entry);
            offset += size;
            segment += 1;
        }

        let updated = self
            .store
            .update_to_tar_location(
                &event.container,
                &event.object_name,
                &event.storage_id,
                &entries,
            )
            .await?;
        if updated {
            debug!(
                container = %event.container,
                object = %event.object_name,
                entries = entries.len(),
                "Object packed"
            );
        } else {
            debug!(
                container = %event.container,
                object = %event.object_name,
                storage_id = %event.storage_id,
                "Object rewritten or deleted while packing, entries left unreferenced"
            );
        }
        self.input_files
            .remove(&event.container, &event.storage_id)
            .await?;
        Ok(())
    }

    async fn append_segment(
        &mut self,
        event: &InputFileEvent,
        source: PathBuf,
        entry_name: String,
        offset: u64,
        size: u64,
    ) -> OfferResult<TarEntryDescription> {
        let mut tar = match self.building.remove(&event.file_bucket_id) {
            Some(tar) if tar.appender.fits(size) => tar,
            Some(full) => {
                self.seal(full).await?;
                self.open_tar(&event.bucket, &event.file_bucket_id).await?
            }
            None => self.open_tar(&event.bucket, &event.file_bucket_id).await?,
        };

        let digest_type = event.digest_type;
        let BuildingTar {
            mut appender,
            bucket,
            file_bucket_id,
            ..
        } = tar;
        let (appender, result) = tokio::task::spawn_blocking(move || {
            let result = std::fs::File::open(&source)
                .and_then(|mut file| file.seek(SeekFrom::Start(offset)).map(|_| file))
                .map_err(OfferError::from)
                .and_then(|file| {
                    appender
                        .append(&entry_name, &mut file.take(size), size, digest_type)
                        .map_err(OfferError::from)
                });
            (appender, result)
        })
        .await?;

        tar = BuildingTar {
            appender,
            bucket,
            file_bucket_id,
            last_append: Instant::now(),
        };
        self.building.insert(event.file_bucket_id.clone(), tar);
        result
    }

    async fn open_tar(&self, bucket: &str, file_bucket_id: &str) -> OfferResult<BuildingTar> {
        let tar_id = new_tar_id();
        let path = self.tar_path(file_bucket_id, &tar_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Registered first so a crash leaves a referential entry to recover from.
        self.store
            .insert_archive(&ArchiveRow::building(&tar_id, bucket, file_bucket_id))
            .await?;
        let max_size = self.max_tar_size;
        let id = tar_id.clone();
        let appender =
            tokio::task::spawn_blocking(move || TarAppender::create(path, id, max_size)).await??;
        info!(tar_id = %tar_id, file_bucket_id, "Opened TAR");
        Ok(BuildingTar {
            appender,
            bucket: bucket.to_string(),
            file_bucket_id: file_bucket_id.to_string(),
            last_append: Instant::now(),
        })
    }

    async fn seal(&self, tar: BuildingTar) -> OfferResult<()> {
        let BuildingTar {
            appender,
            bucket,
            file_bucket_id,
            ..
        } = tar;
        let tar_id = appender.tar_id().to_string();

        if appender.is_empty() {
            let path = appender.path().to_path_buf();
            drop(appender);
            remove_if_exists(&path).await?;
            remove_if_exists(&index_path(&path)).await?;
            self.store.delete_archive(&tar_id).await?;
            debug!(tar_id = %tar_id, "Dropped empty TAR");
            return Ok(());
        }

        let sealed =
            tokio::task::spawn_blocking(move || appender.finalize(TAR_DIGEST_TYPE)).await??;
        self.metrics.tars_sealed.inc();

        let event = SealedTarEvent {
            archive_id: sealed.tar_id,
            bucket,
            file_bucket_id,
            path: sealed.path,
            size: sealed.size,
            digest: sealed.digest,
        };
        if self.sealed_tx.send(event).is_err() {
            // Picked up again from the building state on the next start.
            warn!(tar_id = %tar_id, "Write order pipeline is gone, sealed TAR not announced");
        }
        Ok(())
    }
}

/// Remove a sealed TAR's index once its entries are recorded in the referential.
pub(crate) async fn drop_index(path: PathBuf) -> OfferResult<()> {
    tokio::task::spawn_blocking(move || discard_index(&path)).await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_ids_sort_by_creation() {
        let first = new_tar_id();
        std::thread::sleep(Duration::from_millis(2));
        let second = new_tar_id();
        assert!(first.ends_with(".tar"));
        assert_eq!(first.len(), 17 + 1 + 36 + 4);
        assert!(first < second);
    }
}
