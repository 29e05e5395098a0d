//! Staging tickets for tape-resident objects.

use crate::archive_cache::ArchiveCache;
use crate::error::{OfferError, OfferResult};
use crate::metrics::OfferMetrics;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tapevault_core::config::AccessRequestConfig;
use tapevault_core::{
    AccessRequestId, AccessRequestStatus, ArchiveLocation, ObjectLocation, QueueMessage,
    QueueOrder, ReadOrder,
};
use tapevault_metadata::MetadataStore;
use tapevault_metadata::models::{AccessRequestRow, ArchiveRow, ObjectRow, RequestedArchive};
use tapevault_storage::StorageError;
use tapevault_storage::persist::validate_name;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

/// Creates, reports and purges access requests.
///
/// A request lists the TARs its objects live in. Archives already on disk
/// or in the cache count as staged; the others get a `ReadOrder` and the
/// drive workers report them staged once copied into the cache.
pub struct AccessRequestManager {
    store: Arc<dyn MetadataStore>,
    cache: Arc<ArchiveCache>,
    metrics: Arc<OfferMetrics>,
    config: AccessRequestConfig,
}

impl AccessRequestManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cache: Arc<ArchiveCache>,
        metrics: Arc<OfferMetrics>,
        config: AccessRequestConfig,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            config,
        }
    }

    #[instrument(skip(self, object_names), fields(objects = object_names.len()))]
    pub async fn create(
        &self,
        container: &str,
        object_names: &[String],
    ) -> OfferResult<AccessRequestId> {
        let names = self.validate(container, object_names)?;
        let objects = self.find_all(container, &names).await?;
        let archives = self.archives_of(&objects).await?;

        let mut requested = Vec::with_capacity(archives.len());
        let mut to_read = Vec::new();
        for archive in &archives {
            let staged = self.is_staged(archive)?;
            requested.push(RequestedArchive {
                archive_id: archive.archive_id.clone(),
                staged,
            });
            if !staged {
                to_read.push(archive);
            }
        }

        let now = OffsetDateTime::now_utc();
        let id = AccessRequestId::new();
        let ready = to_read.is_empty();
        let row = AccessRequestRow {
            request_id: *id.as_uuid(),
            container: container.to_string(),
            object_names: serde_json::to_string(&names)
                .map_err(|e| OfferError::InvalidArgument(e.to_string()))?,
            creation_date: now,
            ready_date: ready.then_some(now),
            expiration_date: ready.then(|| now + self.config.expiration_delay()),
            purge_date: Some(if ready {
                now + self.config.purge_delay()
            } else {
                now + self.config.pending_timeout()
            }),
        };
        self.store.insert_access_request(&row, &requested).await?;
        self.metrics.access_requests_created.inc();

        for archive in to_read {
            // Staged between the first check and the insert.
            if self.cache.contains(&archive.file_bucket_id, &archive.archive_id) {
                self.store
                    .mark_archive_staged(
                        &archive.archive_id,
                        OffsetDateTime::now_utc(),
                        self.config.expiration_delay(),
                        self.config.purge_delay(),
                    )
                    .await?;
                continue;
            }
            self.enqueue_read(archive).await?;
        }

        info!(
            request_id = %id,
            container,
            ready,
            archives = archives.len(),
            "Access request created"
        );
        Ok(id)
    }

    /// Status of each id. Unknown and purged ids are `NOT_FOUND`.
    pub async fn statuses(
        &self,
        ids: &[AccessRequestId],
    ) -> OfferResult<HashMap<AccessRequestId, AccessRequestStatus>> {
        let uuids: Vec<_> = ids.iter().map(|id| *id.as_uuid()).collect();
        let records = self.store.find_access_requests(&uuids).await?;
        let now = OffsetDateTime::now_utc();

        let mut statuses: HashMap<_, _> = ids
            .iter()
            .map(|id| (*id, AccessRequestStatus::NotFound))
            .collect();
        for record in records {
            statuses.insert(record.id(), record.status(now));
        }
        Ok(statuses)
    }

    /// Delete a request. Removing an unknown request is not an error.
    pub async fn remove(&self, id: &AccessRequestId) -> OfferResult<()> {
        if self.store.delete_access_request(*id.as_uuid()).await? {
            debug!(request_id = %id, "Access request removed");
        }
        Ok(())
    }

    /// Whether every object can be read without staging.
    pub async fn check_object_availability(
        &self,
        container: &str,
        object_names: &[String],
    ) -> OfferResult<bool> {
        let names = self.validate(container, object_names)?;
        let objects = self.find_all(container, &names).await?;
        for archive in self.archives_of(&objects).await? {
            if !self.is_staged(&archive)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete requests past their purge date, including pending ones that
    /// waited longer than the pending timeout.
    pub async fn purge_expired(&self) -> OfferResult<u64> {
        let purged = self
            .store
            .purge_access_requests(OffsetDateTime::now_utc())
            .await?;
        if purged > 0 {
            self.metrics.access_requests_purged.inc_by(purged);
            info!(purged, "Purged access requests");
        }
        Ok(purged)
    }

    /// Purge periodically until shutdown.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.cleanup_interval().max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        error!(error = %e, "Access request purge failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn validate(&self, container: &str, object_names: &[String]) -> OfferResult<Vec<String>> {
        validate_name(container)?;
        if object_names.is_empty() {
            return Err(OfferError::InvalidArgument("no object names".to_string()));
        }
        if object_names.len() > self.config.max_objects_per_request {
            return Err(OfferError::InvalidArgument(format!(
                "{} objects requested, at most {} allowed",
                object_names.len(),
                self.config.max_objects_per_request
            )));
        }
        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(object_names.len());
        for name in object_names {
            validate_name(name)?;
            if seen.insert(name.as_str()) {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    async fn find_all(&self, container: &str, names: &[String]) -> OfferResult<Vec<ObjectRow>> {
        let objects = self.store.find_objects(container, names).await?;
        if objects.len() != names.len() {
            let found: HashSet<_> = objects.iter().map(|o| o.object_name.as_str()).collect();
            let missing = names
                .iter()
                .find(|name| !found.contains(name.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(StorageError::NotFound(format!("{container}/{missing}")).into());
        }
        Ok(objects)
    }

    /// TARs holding the packed objects, each once. Objects still in input
    /// files need no staging.
    async fn archives_of(&self, objects: &[ObjectRow]) -> OfferResult<Vec<ArchiveRow>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        for object in objects {
            if let ObjectLocation::Tar { entries } = object.location()? {
                for entry in entries {
                    if seen.insert(entry.tar_id.clone()) {
                        ids.push(entry.tar_id);
                    }
                }
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let archives = self.store.find_archives(&ids).await?;
        if archives.len() != ids.len() {
            let found: HashSet<_> = archives.iter().map(|a| a.archive_id.as_str()).collect();
            let missing = ids
                .iter()
                .find(|id| !found.contains(id.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(StorageError::Server(format!(
                "archive {missing} is missing from the referential"
            ))
            .into());
        }
        Ok(archives)
    }

    fn is_staged(&self, archive: &ArchiveRow) -> OfferResult<bool> {
        Ok(archive.location()?.is_on_disk()
            || self.cache.contains(&archive.file_bucket_id, &archive.archive_id))
    }

    async fn enqueue_read(&self, archive: &ArchiveRow) -> OfferResult<()> {
        let ArchiveLocation::OnTape {
            tape_code,
            file_position,
        } = archive.location()?
        else {
            return Ok(());
        };
        let order = QueueOrder::ReadOrder(ReadOrder {
            tape_code,
            file_position,
            file_name: archive.archive_id.clone(),
            bucket: archive.bucket.clone(),
            file_bucket_id: archive.file_bucket_id.clone(),
            size: archive.size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
        });
        let message = QueueMessage::new(order);
        if self
            .store
            .add_if_absent(&message.order.natural_key(), &message)
            .await?
        {
            self.metrics.record_enqueued(message.message_type());
            debug!(tar_id = %archive.archive_id, "Read order enqueued");
        }
        Ok(())
    }
}
