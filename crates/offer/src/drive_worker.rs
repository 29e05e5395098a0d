//! One worker per tape drive.
//!
//! A worker claims queue messages, mounts the cartridge they need through the
//! robot and runs the tape write or read. Reads go first, and orders for the
//! cartridge already mounted are preferred over ones that need a robot move.
//!
//! Device calls block, so they run on the blocking pool; a worker never has
//! two commands in flight on its drive. A cartridge is claimed by recording
//! it in the drive in the catalog, conditioned on no drive holding it, before
//! the robot moves it. Reads for cartridges held by another drive are left
//! in the queue for that drive.
//!
//! A device failure returns the message to the queue. When the failure
//! leaves the head position unknown the cartridge is flagged `CONFLICT` and
//! no longer picked for writes. A read that can never succeed expires the
//! access requests waiting for its archive.

use crate::archive_cache::ArchiveCache;
use crate::error::{OfferError, OfferResult};
use crate::metrics::OfferMetrics;
use crate::tar_builder::TAR_DIGEST_TYPE;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapevault_core::config::{AccessRequestConfig, AppConfig, WorkerConfig};
use tapevault_core::{
    ArchiveLocation, QueryCriteria, QueryOperator, QueueMessage, QueueMessageType, QueueOrder,
    ReadOrder, TapeCatalog, TapeLocation, TapeState, WriteOrder,
};
use tapevault_device::{
    DeviceError, DeviceResult, DriveHandle, TapeDriveCommandService, TapeDriveStatus,
    TapeLoadUnloadService, TapeReadWriteService,
};
use tapevault_metadata::MetadataStore;
use tapevault_storage::StorageError;
use tapevault_storage::persist::digest_path;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What became of a claimed message.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Completed,
    /// The cartridge is mounted elsewhere; give the message back untouched.
    Deferred,
    /// The order can never succeed; drop it.
    Abandoned(String),
}

/// Executes queued tape writes and reads on one drive.
pub struct DriveWorker {
    drive: DriveHandle,
    robot: Arc<dyn TapeLoadUnloadService>,
    store: Arc<dyn MetadataStore>,
    cache: Arc<ArchiveCache>,
    metrics: Arc<OfferMetrics>,
    library: String,
    tmp_dir: PathBuf,
    access_request: AccessRequestConfig,
    worker: WorkerConfig,
    /// Cartridge in the drive, as last written to the catalog.
    current: Option<TapeCatalog>,
    /// File number under the head, when known.
    position: Option<u32>,
}

impl DriveWorker {
    pub fn new(
        drive: DriveHandle,
        robot: Arc<dyn TapeLoadUnloadService>,
        store: Arc<dyn MetadataStore>,
        cache: Arc<ArchiveCache>,
        metrics: Arc<OfferMetrics>,
        config: &AppConfig,
    ) -> Self {
        Self {
            drive,
            robot,
            store,
            cache,
            metrics,
            library: config.library.name.clone(),
            tmp_dir: config.storage.tmp_tar_output_path.clone(),
            access_request: config.access_request.clone(),
            worker: config.worker.clone(),
            current: None,
            position: None,
        }
    }

    pub fn drive_index(&self) -> u32 {
        self.drive.index
    }

    /// Cartridge currently mounted, if any.
    pub fn current_tape(&self) -> Option<&TapeCatalog> {
        self.current.as_ref()
    }

    /// Learn which cartridge sits in the drive and fix the catalog if it
    /// disagrees with the robot.
    pub async fn initialize(&mut self) -> OfferResult<()> {
        let spec = self.robot_command("status", |robot| robot.status()).await?;
        let content = spec
            .drive(self.drive.index)
            .and_then(|slot| slot.tape.clone());
        let Some(content) = content else {
            debug!(drive = self.drive.index, "Drive is empty");
            return Ok(());
        };
        let Some(code) = content.volume_tag.clone() else {
            warn!(drive = self.drive.index, "Drive holds a cartridge without barcode");
            return Ok(());
        };
        let Some(mut tape) = self.store.find_tape_by_code(&code).await? else {
            warn!(
                drive = self.drive.index,
                tape = %code,
                "Drive holds a cartridge missing from the catalog"
            );
            return Ok(());
        };

        if tape.current_location != TapeLocation::Drive(self.drive.index) {
            warn!(
                drive = self.drive.index,
                tape = %code,
                recorded = %tape.current_location,
                "Catalog location disagrees with the robot, fixing"
            );
            if tape.current_location.is_drive() {
                tape.current_location = TapeLocation::Drive(self.drive.index);
            } else {
                tape.loaded_into_drive(self.drive.index)?;
            }
            if let Some(source) = content.source_slot {
                tape.previous_location = Some(TapeLocation::Slot(source));
            }
            self.store.replace_tape(&tape).await?;
        }
        info!(drive = self.drive.index, tape = %code, "Found mounted cartridge");
        self.current = Some(tape);
        self.position = None;
        Ok(())
    }

    /// Poll the queue until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.initialize().await {
            error!(drive = self.drive.index, error = %e, "Drive worker initialization failed");
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.process_next().await {
                Ok(true) => None,
                Ok(false) => Some(self.worker.poll_interval()),
                Err(e) => {
                    error!(drive = self.drive.index, error = %e, "Drive worker step failed");
                    Some(self.worker.error_backoff())
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!(drive = self.drive.index, "Drive worker stopped");
    }

    /// Claim and execute one message.
    ///
    /// Returns `false` when nothing was done (empty queue or deferred order),
    /// so the caller can pause before polling again.
    pub async fn process_next(&mut self) -> OfferResult<bool> {
        let Some(message) = self.claim().await? else {
            return Ok(false);
        };
        let message_type = message.message_type();
        self.metrics.record_claimed(message_type);

        let result = match &message.order {
            QueueOrder::ReadOrder(order) => self.execute_read(order).await,
            QueueOrder::WriteOrder(order) | QueueOrder::WriteBackupOrder(order) => {
                self.execute_write(order).await
            }
        };

        match result {
            Ok(Disposition::Completed) => {
                self.store.complete(message.id).await?;
                self.metrics.record_completed(message_type);
                Ok(true)
            }
            Ok(Disposition::Deferred) => {
                self.store.mark_ready(message.id).await?;
                debug!(drive = self.drive.index, message_id = %message.id, "Order deferred");
                Ok(false)
            }
            Ok(Disposition::Abandoned(reason)) => {
                error!(
                    drive = self.drive.index,
                    message_id = %message.id,
                    message_type = %message_type.as_str(),
                    reason = %reason,
                    "Order abandoned"
                );
                if let QueueOrder::ReadOrder(order) = &message.order
                    && let Err(e) = self.abort_staging(&order.file_name, &reason).await
                {
                    self.store.mark_ready(message.id).await?;
                    return Err(e);
                }
                self.store.remove(message.id).await?;
                Ok(true)
            }
            Err(e) => {
                self.store.mark_ready(message.id).await?;
                self.metrics.record_retried(message_type);
                Err(e)
            }
        }
    }

    async fn claim(&self) -> OfferResult<Option<QueueMessage>> {
        if let Some(tape) = &self.current {
            let filter = [QueryCriteria::eq("tape_code", tape.code.as_str())];
            if let Some(message) = self
                .store
                .receive_with(&filter, &[], QueueMessageType::ReadOrder, true)
                .await?
            {
                return Ok(Some(message));
            }
        }
        // Reads for a cartridge in another drive wait for that drive.
        let busy: Vec<QueryCriteria> = self
            .tapes_in_other_drives()
            .await?
            .into_iter()
            .map(|code| QueryCriteria::new("tape_code", QueryOperator::Ne, code))
            .collect();
        if let Some(message) = self
            .store
            .receive_with(&busy, &[], QueueMessageType::ReadOrder, true)
            .await?
        {
            return Ok(Some(message));
        }

        let write_types = [QueueMessageType::WriteOrder, QueueMessageType::WriteBackupOrder];
        if let Some(tape) = &self.current
            && tape.state == TapeState::Open
            && let Some(bucket) = &tape.bucket
        {
            let filter = [QueryCriteria::eq("bucket", bucket.as_str())];
            for message_type in write_types {
                if let Some(message) = self
                    .store
                    .receive_with(&filter, &[], message_type, true)
                    .await?
                {
                    return Ok(Some(message));
                }
            }
        }
        for message_type in write_types {
            if let Some(message) = self.store.receive(message_type, true).await? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Codes of the cartridges the catalog shows in another drive.
    async fn tapes_in_other_drives(&self) -> OfferResult<Vec<String>> {
        let mounted = self
            .store
            .find_tapes(&[QueryCriteria::eq("current_location.type", "drive")])
            .await?;
        Ok(mounted
            .into_iter()
            .filter(|tape| tape.current_location != TapeLocation::Drive(self.drive.index))
            .map(|tape| tape.code)
            .collect())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[instrument(skip(self, order), fields(drive = self.drive.index, tar_id = %order.archive_id))]
    async fn execute_write(&mut self, order: &WriteOrder) -> OfferResult<Disposition> {
        let Some(archive) = self.store.find_archive(&order.archive_id).await? else {
            return Ok(Disposition::Abandoned(format!(
                "archive {} is not in the referential",
                order.archive_id
            )));
        };
        if let ArchiveLocation::OnTape { tape_code, .. } = archive.location()? {
            debug!(tape = %tape_code, "Archive already on tape");
            return Ok(Disposition::Completed);
        }
        let tar_path = PathBuf::from(&order.file_path);
        if !tokio::fs::try_exists(&tar_path).await? {
            return Ok(Disposition::Abandoned(format!(
                "TAR file {} is missing",
                order.file_path
            )));
        }

        let Some(tape) = self.select_tape_for_write(order).await? else {
            return Err(OfferError::NoTapeAvailable(order.bucket.clone()));
        };
        if !self.mount(tape).await? {
            return Ok(Disposition::Deferred);
        }
        let (code, file_position) = match &self.current {
            Some(tape) => (tape.code.clone(), tape.file_count),
            None => return Err(OfferError::InvalidArgument("no cartridge mounted".to_string())),
        };

        self.drive_command("goToEnd", |drive| drive.go_to_end()).await?;
        let status = self.drive_command("status", |drive| drive.status()).await?;
        self.check_position(&status, file_position).await?;
        if status.is_write_protected() {
            self.flag_conflict("cartridge is write protected").await;
            return Err(OfferError::InvalidArgument(format!(
                "tape {code} is write protected"
            )));
        }

        let source = tar_path.clone();
        self.read_write_command("write", move |rw| rw.write_to_tape(&source))
            .await?;
        self.position = Some(file_position + 1);

        if let Some(tape) = self.current.as_mut() {
            tape.record_file_written(order.size)?;
            tape.bucket = Some(order.bucket.clone());
            self.store.replace_tape(tape).await?;
        }
        self.metrics.tars_written.inc();
        self.metrics.bytes_written_to_tape.inc_by(order.size);
        info!(tape = %code, file_position, size = order.size, "TAR written to tape");

        // The input TAR stays in place until the referential points at the
        // tape; a failed update retries the order with the TAR still there.
        self.store
            .update_location_to_on_tape(&order.archive_id, &code, file_position)
            .await?;
        self.keep_or_delete_written_tar(order, &tar_path).await;
        Ok(Disposition::Completed)
    }

    /// Mounted cartridge if it fits, else an open cartridge of the bucket,
    /// else an empty one.
    async fn select_tape_for_write(
        &mut self,
        order: &WriteOrder,
    ) -> OfferResult<Option<TapeCatalog>> {
        let library = self.library.clone();
        let fits = |tape: &TapeCatalog| {
            tape.can_hold(order.size)
                && tape.bucket.as_deref().is_none_or(|b| b == order.bucket)
                && tape.library.as_deref().is_none_or(|l| l == library)
        };

        if let Some(current) = self.current.as_mut() {
            if fits(current) {
                return Ok(Some(current.clone()));
            }
            if current.state == TapeState::Open
                && current.bucket.as_deref() == Some(order.bucket.as_str())
            {
                info!(tape = %current.code, remaining = current.remaining_size, "Tape full");
                current.mark_full();
                self.store.replace_tape(current).await?;
            }
        }

        let open = self
            .store
            .find_tapes(&[
                QueryCriteria::eq("state", TapeState::Open.as_str()),
                QueryCriteria::eq("bucket", order.bucket.as_str()),
            ])
            .await?;
        let empty = self
            .store
            .find_tapes(&[QueryCriteria::eq("state", TapeState::Empty.as_str())])
            .await?;
        let candidate = open
            .into_iter()
            .chain(empty)
            .find(|tape| fits(tape) && !tape.current_location.is_drive());
        Ok(candidate)
    }

    /// Keep a copy of a TAR now on tape in the cache when room allows,
    /// otherwise delete it.
    async fn keep_or_delete_written_tar(&self, order: &WriteOrder, tar_path: &Path) {
        let now = OffsetDateTime::now_utc();
        let kept = match self.store.locked_archive_ids(now).await {
            Ok(locked) => self
                .cache
                .reserve(&order.file_bucket_id, &order.archive_id, order.size, &locked)
                .and_then(|_| {
                    self.cache
                        .move_to_cache(tar_path, &order.file_bucket_id, &order.archive_id)
                        .inspect_err(|_| {
                            self.cache.cancel(&order.file_bucket_id, &order.archive_id)
                        })
                })
                .is_ok(),
            Err(e) => {
                warn!(error = %e, "Could not read cache locks");
                false
            }
        };
        self.record_cache_usage();
        if !kept && let Err(e) = crate::input_files::remove_if_exists(tar_path).await {
            warn!(path = %tar_path.display(), error = %e, "Could not delete written TAR");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[instrument(skip(self, order), fields(drive = self.drive.index, tar_id = %order.file_name))]
    async fn execute_read(&mut self, order: &ReadOrder) -> OfferResult<Disposition> {
        let Some(archive) = self.store.find_archive(&order.file_name).await? else {
            return Ok(Disposition::Abandoned(format!(
                "archive {} is not in the referential",
                order.file_name
            )));
        };
        if self.cache.contains(&order.file_bucket_id, &order.file_name) {
            self.notify_staged(&order.file_name).await?;
            return Ok(Disposition::Completed);
        }
        let Some(tape) = self.store.find_tape_by_code(&order.tape_code).await? else {
            return Ok(Disposition::Abandoned(format!(
                "tape {} is not in the catalog",
                order.tape_code
            )));
        };
        if !self.mount(tape).await? {
            return Ok(Disposition::Deferred);
        }

        let locked = self
            .store
            .locked_archive_ids(OffsetDateTime::now_utc())
            .await?;
        self.cache
            .reserve(&order.file_bucket_id, &order.file_name, order.size, &locked)?;

        let read = self.read_archive(order, archive.digest.as_deref()).await;
        let staged = read.and_then(|tmp| {
            self.cache
                .move_to_cache(&tmp, &order.file_bucket_id, &order.file_name)
                .map(|_| ())
        });
        if let Err(e) = staged {
            self.cache.cancel(&order.file_bucket_id, &order.file_name);
            return match e {
                OfferError::Storage(StorageError::Corruption { .. }) => {
                    Ok(Disposition::Abandoned(e.to_string()))
                }
                other => Err(other),
            };
        }
        self.record_cache_usage();
        self.metrics.archives_staged.inc();
        self.notify_staged(&order.file_name).await?;
        info!(tape = %order.tape_code, file_position = order.file_position, "Archive staged");
        Ok(Disposition::Completed)
    }

    /// Read the TAR at `order.file_position` into a temporary file and check
    /// it against the digest recorded when it was sealed.
    async fn read_archive(
        &mut self,
        order: &ReadOrder,
        expected: Option<&str>,
    ) -> OfferResult<PathBuf> {
        self.position_at(order.file_position).await?;

        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let tmp = self
            .tmp_dir
            .join(format!("{}.{}.read", order.file_name, uuid::Uuid::new_v4()));
        let target = tmp.clone();
        let result = self
            .read_write_command("read", move |rw| rw.read_from_tape(&target))
            .await;
        if let Err(e) = result {
            let _ = crate::input_files::remove_if_exists(&tmp).await;
            return Err(e);
        }
        self.position = Some(order.file_position + 1);

        if let Some(expected) = expected {
            let (actual, _) = digest_path(&tmp, TAR_DIGEST_TYPE).await?;
            if actual != expected {
                let _ = crate::input_files::remove_if_exists(&tmp).await;
                return Err(OfferError::Storage(StorageError::Corruption {
                    object: order.file_name.clone(),
                    expected: expected.to_string(),
                    actual,
                }));
            }
        }
        Ok(tmp)
    }

    /// Put the head at the start of file `target`.
    async fn position_at(&mut self, target: u32) -> OfferResult<()> {
        let current = match self.position {
            Some(position) => position,
            None => {
                let status = self.drive_command("status", |drive| drive.status()).await?;
                match status.file_number {
                    Some(position) if status.block_number.unwrap_or(0) == 0 => position,
                    _ => {
                        self.drive_command("rewind", |drive| drive.rewind()).await?;
                        0
                    }
                }
            }
        };

        if target == current {
            // Already there.
        } else if target == 0 {
            self.drive_command("rewind", |drive| drive.rewind()).await?;
        } else if target > current {
            let count = target - current;
            self.drive_command("move", move |drive| drive.move_position(count, false))
                .await?;
        } else {
            let count = current - target;
            self.drive_command("move", move |drive| drive.move_position(count, true))
                .await?;
        }

        let status = self.drive_command("status", |drive| drive.status()).await?;
        self.check_position(&status, target).await?;
        self.position = Some(target);
        Ok(())
    }

    async fn check_position(
        &mut self,
        status: &TapeDriveStatus,
        expected: u32,
    ) -> OfferResult<()> {
        match status.file_number {
            Some(actual) if actual != expected => {
                let tape = self
                    .current
                    .as_ref()
                    .map(|t| t.code.clone())
                    .unwrap_or_default();
                self.flag_conflict("drive position disagrees with the catalog")
                    .await;
                Err(OfferError::PositionMismatch {
                    tape,
                    expected,
                    actual,
                })
            }
            _ => Ok(()),
        }
    }

    async fn notify_staged(&self, archive_id: &str) -> OfferResult<()> {
        let ready = self
            .store
            .mark_archive_staged(
                archive_id,
                OffsetDateTime::now_utc(),
                self.access_request.expiration_delay(),
                self.access_request.purge_delay(),
            )
            .await?;
        for request_id in ready {
            info!(request_id = %request_id, "Access request ready");
        }
        Ok(())
    }

    /// Expire the access requests waiting for an archive that cannot be read.
    async fn abort_staging(&self, archive_id: &str, reason: &str) -> OfferResult<()> {
        let aborted = self
            .store
            .abort_archive_staging(
                archive_id,
                OffsetDateTime::now_utc(),
                self.access_request.purge_delay(),
            )
            .await?;
        self.metrics.access_requests_aborted.inc_by(aborted.len() as u64);
        for request_id in aborted {
            error!(request_id = %request_id, tar_id = archive_id, reason, "Access request expired");
        }
        Ok(())
    }

    fn record_cache_usage(&self) {
        let used = i64::try_from(self.cache.used()).unwrap_or(i64::MAX);
        self.metrics.cache_used_bytes.set(used);
    }

    // =========================================================================
    // Mounting
    // =========================================================================

    /// Make `tape` the mounted cartridge. Returns `false` when another drive
    /// holds it.
    async fn mount(&mut self, tape: TapeCatalog) -> OfferResult<bool> {
        if self.current.as_ref().is_some_and(|t| t.code == tape.code) {
            return Ok(true);
        }
        if tape.current_location.is_drive() {
            return Ok(false);
        }
        let drive = self.drive.index;
        let Some(claimed) = self.store.claim_tape_for_drive(&tape.code, drive).await? else {
            debug!(drive, tape = %tape.code, "Tape claimed by another drive");
            return Ok(false);
        };
        let origin = claimed.previous_location.unwrap_or(tape.current_location);
        let slot = origin.index();

        if let Err(e) = self.unmount().await {
            self.give_back(claimed, origin, false).await;
            return Err(e);
        }
        let robot = self.robot.clone();
        let loaded = tokio::task::spawn_blocking(move || robot.load_tape(slot, drive)).await?;
        if let Err(e) = loaded {
            self.record_device_failure("load", &e);
            self.give_back(claimed, origin, true).await;
            return Err(e.into());
        }

        info!(drive, tape = %claimed.code, slot, "Tape loaded");
        self.current = Some(claimed);
        self.position = Some(0);
        Ok(true)
    }

    /// Undo a catalog claim the robot did not follow.
    async fn give_back(&self, mut tape: TapeCatalog, origin: TapeLocation, conflict: bool) {
        tape.current_location = origin;
        if conflict {
            tape.mark_conflict();
        }
        if let Err(e) = self.store.replace_tape(&tape).await {
            warn!(tape = %tape.code, error = %e, "Could not release tape claim");
        }
    }

    /// Return the mounted cartridge to its slot.
    pub async fn unmount(&mut self) -> OfferResult<()> {
        let Some(code) = self.current.as_ref().map(|t| t.code.clone()) else {
            return Ok(());
        };
        let home = self.current.as_ref().and_then(TapeCatalog::home_slot);
        let slot = match home {
            Some(slot) => slot,
            None => self.free_slot().await?,
        };
        let drive = self.drive.index;
        self.robot_command("unload", move |robot| robot.unload_tape(slot, drive))
            .await?;

        self.current = None;
        self.position = None;
        self.store.release_tape_to_slot(&code, drive, slot).await?;
        info!(drive, tape = %code, slot, "Tape unloaded");
        Ok(())
    }

    async fn free_slot(&mut self) -> OfferResult<u32> {
        let spec = self.robot_command("status", |robot| robot.status()).await?;
        spec.slots
            .iter()
            .find(|slot| !slot.import_export && slot.tape.is_none())
            .map(|slot| slot.index)
            .ok_or_else(|| OfferError::InvalidArgument("no free slot in the library".to_string()))
    }

    // =========================================================================
    // Device calls
    // =========================================================================

    async fn drive_command<T: Send + 'static>(
        &mut self,
        operation: &'static str,
        command: impl FnOnce(&dyn TapeDriveCommandService) -> DeviceResult<T> + Send + 'static,
    ) -> OfferResult<T> {
        let service = self.drive.commands.clone();
        let result = tokio::task::spawn_blocking(move || command(service.as_ref())).await?;
        self.device_result(operation, result, operation != "status").await
    }

    async fn read_write_command<T: Send + 'static>(
        &mut self,
        operation: &'static str,
        command: impl FnOnce(&dyn TapeReadWriteService) -> DeviceResult<T> + Send + 'static,
    ) -> OfferResult<T> {
        let service = self.drive.read_write.clone();
        let result = tokio::task::spawn_blocking(move || command(service.as_ref())).await?;
        self.device_result(operation, result, true).await
    }

    async fn robot_command<T: Send + 'static>(
        &mut self,
        operation: &'static str,
        command: impl FnOnce(&dyn TapeLoadUnloadService) -> DeviceResult<T> + Send + 'static,
    ) -> OfferResult<T> {
        let service = self.robot.clone();
        let result = tokio::task::spawn_blocking(move || command(service.as_ref())).await?;
        self.device_result(operation, result, false).await
    }

    /// A failure of a command that moves the head leaves the position unknown.
    async fn device_result<T>(
        &mut self,
        operation: &'static str,
        result: DeviceResult<T>,
        moves_head: bool,
    ) -> OfferResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.record_device_failure(operation, &e);
                if moves_head {
                    self.flag_conflict(operation).await;
                }
                Err(e.into())
            }
        }
    }

    fn record_device_failure(&self, operation: &'static str, error: &DeviceError) {
        self.metrics.record_device_failure(operation);
        let output = error.output();
        warn!(
            drive = self.drive.index,
            operation,
            exit_code = ?output.and_then(|o| o.exit_code),
            timed_out = output.is_some_and(|o| o.timed_out),
            stderr = output.map(|o| o.stderr.trim()).unwrap_or(""),
            error = %error,
            "Device command failed"
        );
    }

    /// Forget the head position and take the mounted cartridge out of write rotation.
    async fn flag_conflict(&mut self, reason: &str) {
        self.position = None;
        let Some(tape) = self.current.as_mut() else {
            return;
        };
        tape.mark_conflict();
        warn!(drive = self.drive.index, tape = %tape.code, reason, "Tape flagged as conflict");
        if let Err(e) = self.store.replace_tape(tape).await {
            warn!(tape = %tape.code, error = %e, "Could not flag tape as conflict");
        }
    }
}
