//! Turns sealed TARs into queued tape writes.

use crate::error::OfferResult;
use crate::metrics::OfferMetrics;
use crate::tar_builder::{SealedTarEvent, drop_index};
use std::path::Path;
use std::sync::Arc;
use tapevault_core::{ArchiveLocationType, QueueMessage, QueueOrder, WriteOrder};
use tapevault_metadata::MetadataStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument};

/// Listener for [`SealedTarEvent`]s.
///
/// For each event the archive is recorded as ready on disk, then a
/// `WriteOrder` is enqueued with `add_if_absent` keyed by bucket, file bucket
/// and TAR path, so a replayed event never produces a second tape write.
pub struct WriteOrderCreator {
    store: Arc<dyn MetadataStore>,
    metrics: Arc<OfferMetrics>,
}

impl WriteOrderCreator {
    pub fn new(store: Arc<dyn MetadataStore>, metrics: Arc<OfferMetrics>) -> Self {
        Self { store, metrics }
    }

    #[instrument(skip(self, event), fields(tar_id = %event.archive_id))]
    pub async fn on_sealed(&self, event: &SealedTarEvent) -> OfferResult<()> {
        let ready = self
            .store
            .update_location_to_ready_on_disk(&event.archive_id, event.size, &event.digest)
            .await?;
        if !ready {
            debug!("Archive already on tape, no write order needed");
            drop_index(event.path.clone()).await?;
            return Ok(());
        }

        self.enqueue(event).await?;
        drop_index(event.path.clone()).await?;
        Ok(())
    }

    /// Enqueue the tape write of a sealed TAR. Returns whether a new message
    /// was inserted.
    pub async fn enqueue(&self, event: &SealedTarEvent) -> OfferResult<bool> {
        let order = QueueOrder::WriteOrder(WriteOrder {
            bucket: event.bucket.clone(),
            file_bucket_id: event.file_bucket_id.clone(),
            file_path: event.path.to_string_lossy().into_owned(),
            size: event.size,
            digest: event.digest.clone(),
            archive_id: event.archive_id.clone(),
        });
        let message = QueueMessage::new(order);
        let inserted = self
            .store
            .add_if_absent(&message.order.natural_key(), &message)
            .await?;
        if inserted {
            self.metrics.record_enqueued(message.message_type());
            info!(tar_id = %event.archive_id, size = event.size, "Write order enqueued");
        } else {
            debug!(tar_id = %event.archive_id, "Write order already queued");
        }
        Ok(inserted)
    }

    /// Re-enqueue every archive waiting on disk. Safe to run at each start.
    pub async fn requeue_ready_archives(&self, input_tars_path: &Path) -> OfferResult<usize> {
        let ready = self
            .store
            .list_archives_by_location(ArchiveLocationType::ReadyOnDisk)
            .await?;
        let mut inserted = 0;
        for archive in ready {
            let (Some(size), Some(digest)) = (archive.size, archive.digest.clone()) else {
                continue;
            };
            let event = SealedTarEvent {
                path: input_tars_path
                    .join(&archive.file_bucket_id)
                    .join(&archive.archive_id),
                archive_id: archive.archive_id,
                bucket: archive.bucket,
                file_bucket_id: archive.file_bucket_id,
                size: u64::try_from(size).unwrap_or(0),
                digest,
            };
            if self.enqueue(&event).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Handle events until the channel closes or shutdown is signalled.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<SealedTarEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.on_sealed(&event).await {
                        // Replayed from the archive referential on the next start.
                        error!(
                            tar_id = %event.archive_id,
                            error = %e,
                            "Failed to enqueue write order"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
