//! Tape library storage offer.
//!
//! This crate assembles the tape tier:
//! - [`input_files`]: objects as written by callers
//! - [`tar_builder`]: packing input files into TAR containers
//! - [`write_order`]: queueing sealed TARs for tape
//! - [`drive_worker`]: one worker per drive executing writes and reads
//! - [`archive_cache`]: TARs staged back from tape, with LRU eviction
//! - [`access_request`]: staging tickets for tape-resident objects
//! - [`tape_storage`]: the content-addressable storage surface
//!
//! [`TapeOffer::start`] wires everything together; workers communicate
//! through the metadata store and in-process channels and stop on a shared
//! shutdown signal.

pub mod access_request;
pub mod archive_cache;
pub mod drive_worker;
pub mod error;
pub mod input_files;
pub mod metrics;
pub mod tape_storage;
pub mod tar_builder;
pub mod write_order;

pub use access_request::AccessRequestManager;
pub use archive_cache::ArchiveCache;
pub use drive_worker::DriveWorker;
pub use error::{OfferError, OfferResult};
pub use metrics::OfferMetrics;
pub use tape_storage::TapeLibraryStorage;
pub use tar_builder::{InputFileEvent, SealedTarEvent, TarBuilder};
pub use write_order::WriteOrderCreator;

use std::sync::Arc;
use std::time::Duration;
use tapevault_core::TapeCatalog;
use tapevault_core::config::{AppConfig, LibraryConfig};
use tapevault_device::{
    DriveHandle, ProcessExecutor, SystemProcessExecutor, TapeLoadUnloadService,
    drive_from_config, robot_from_config,
};
use tapevault_metadata::MetadataStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Robot and drives of the library.
pub struct LibraryDevices {
    pub robot: Arc<dyn TapeLoadUnloadService>,
    pub drives: Vec<DriveHandle>,
}

impl LibraryDevices {
    /// `mtx`, `mt` and `dd` services for the configured library, or `None`
    /// when no robot is configured.
    pub fn from_config(library: &LibraryConfig) -> Option<Self> {
        let robot = library.robot.as_ref()?;
        let executor: Arc<dyn ProcessExecutor> = Arc::new(SystemProcessExecutor::new());
        Some(Self {
            robot: robot_from_config(robot, executor.clone()),
            drives: library
                .drives
                .iter()
                .map(|drive| drive_from_config(drive, executor.clone()))
                .collect(),
        })
    }
}

/// Register the cartridges declared in configuration that the catalog does
/// not know yet. Returns how many were created.
pub async fn register_declared_tapes(
    store: &dyn MetadataStore,
    library: &LibraryConfig,
) -> OfferResult<usize> {
    let mut created = 0;
    for declared in &library.tapes {
        if store.find_tape_by_code(&declared.code).await?.is_some() {
            continue;
        }
        let mut tape = TapeCatalog::new(&declared.code, declared.slot, declared.capacity);
        tape.library = Some(library.name.clone());
        store.create_tape(&tape).await?;
        info!(tape = %tape.code, slot = declared.slot, "Registered tape");
        created += 1;
    }
    Ok(created)
}

/// A running tape offer.
pub struct TapeOffer {
    storage: Arc<TapeLibraryStorage>,
    cache: Arc<ArchiveCache>,
    metrics: Arc<OfferMetrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TapeOffer {
    /// Recover state left by a previous run and spawn every worker.
    ///
    /// Without `devices` no drive worker runs: objects are still accepted
    /// and packed, and write orders wait in the queue.
    pub async fn start(
        config: &AppConfig,
        store: Arc<dyn MetadataStore>,
        devices: Option<LibraryDevices>,
        metrics: Arc<OfferMetrics>,
    ) -> OfferResult<Self> {
        let storage_conf = &config.storage;
        for dir in [
            &storage_conf.input_files_path,
            &storage_conf.input_tars_path,
            &storage_conf.tmp_tar_output_path,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let registered = register_declared_tapes(store.as_ref(), &config.library).await?;
        let requeued = store.requeue_running().await?;
        if requeued > 0 {
            warn!(count = requeued, "Returned orders left running by a previous instance");
        }

        let cache = Arc::new(ArchiveCache::open(
            &storage_conf.cache_path,
            storage_conf.cache_max_capacity,
        )?);
        metrics
            .cache_used_bytes
            .set(i64::try_from(cache.used()).unwrap_or(i64::MAX));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let mut builder = TarBuilder::new(
            store.clone(),
            storage_conf,
            config.topology.clone(),
            sealed_tx,
            metrics.clone(),
        );
        builder.recover().await?;
        tasks.push(tokio::spawn(builder.run(input_rx, shutdown_rx.clone())));

        let creator = WriteOrderCreator::new(store.clone(), metrics.clone());
        let replayed = creator
            .requeue_ready_archives(&storage_conf.input_tars_path)
            .await?;
        tasks.push(tokio::spawn(creator.run(sealed_rx, shutdown_rx.clone())));

        let access_requests = Arc::new(AccessRequestManager::new(
            store.clone(),
            cache.clone(),
            metrics.clone(),
            config.access_request.clone(),
        ));
        tasks.push(tokio::spawn(
            access_requests.clone().run_cleanup(shutdown_rx.clone()),
        ));

        let mut drive_count = 0;
        if let Some(devices) = devices {
            for drive in devices.drives {
                let worker = DriveWorker::new(
                    drive,
                    devices.robot.clone(),
                    store.clone(),
                    cache.clone(),
                    metrics.clone(),
                    config,
                );
                tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
                drive_count += 1;
            }
        }

        let stats_interval = Duration::from_secs(config.metrics.interval_secs.max(1));
        tasks.push(spawn_tape_stats(
            store.clone(),
            metrics.clone(),
            stats_interval,
            shutdown_rx.clone(),
        ));
        if let Some(path) = &config.metrics.textfile_path {
            tasks.push(metrics::spawn_textfile_exporter(
                metrics.clone(),
                path.clone(),
                stats_interval,
                shutdown_rx.clone(),
            ));
        }

        let storage = Arc::new(TapeLibraryStorage::new(
            store,
            storage_conf,
            config.topology.clone(),
            cache.clone(),
            access_requests,
            input_tx,
        ));

        info!(
            registered_tapes = registered,
            replayed_write_orders = replayed,
            drives = drive_count,
            "Tape offer started"
        );
        Ok(Self {
            storage,
            cache,
            metrics,
            shutdown_tx,
            tasks,
        })
    }

    pub fn storage(&self) -> Arc<TapeLibraryStorage> {
        self.storage.clone()
    }

    pub fn cache(&self) -> &Arc<ArchiveCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<OfferMetrics> {
        &self.metrics
    }

    /// Signal every worker and wait for them to stop. A drive worker
    /// finishes the device command in flight first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Offer task failed");
            }
        }
        info!("Tape offer stopped");
    }
}

/// Refresh the per-state tape gauges every `interval` until shutdown.
fn spawn_tape_stats(
    store: Arc<dyn MetadataStore>,
    metrics: Arc<OfferMetrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match store.count_by_state().await {
                Ok(counts) => metrics.set_tape_counts(&counts),
                Err(e) => warn!(error = %e, "Failed to count tapes by state"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}
