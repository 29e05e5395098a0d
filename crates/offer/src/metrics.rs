//! Prometheus metrics for the tape offer.
//!
//! Metrics live in an [`OfferMetrics`] value that owns its registry. The
//! daemon builds it once and hands it to every worker; nothing is global.
//! There is no HTTP endpoint: the registry is periodically written to a
//! text file for the node_exporter textfile collector.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tapevault_core::{QueueMessageType, TapeState};
use tokio::sync::watch;

/// Counters and gauges shared by the offer's workers.
pub struct OfferMetrics {
    registry: Registry,
    pub queue_enqueued: IntCounterVec,
    pub queue_claimed: IntCounterVec,
    pub queue_completed: IntCounterVec,
    pub queue_retried: IntCounterVec,
    pub device_failures: IntCounterVec,
    pub tars_sealed: IntCounter,
    pub tars_written: IntCounter,
    pub bytes_written_to_tape: IntCounter,
    pub archives_staged: IntCounter,
    pub access_requests_created: IntCounter,
    pub access_requests_purged: IntCounter,
    pub access_requests_aborted: IntCounter,
    pub cache_used_bytes: IntGauge,
    pub tapes_by_state: IntGaugeVec,
}

impl OfferMetrics {
    /// Create every metric and register it in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let queue_enqueued = IntCounterVec::new(
            Opts::new(
                "tapevault_queue_messages_enqueued_total",
                "Queue messages inserted, by message type",
            ),
            &["type"],
        )?;
        let queue_claimed = IntCounterVec::new(
            Opts::new(
                "tapevault_queue_messages_claimed_total",
                "Queue messages claimed by a drive worker, by message type",
            ),
            &["type"],
        )?;
        let queue_completed = IntCounterVec::new(
            Opts::new(
                "tapevault_queue_messages_completed_total",
                "Queue messages completed successfully, by message type",
            ),
            &["type"],
        )?;
        let queue_retried = IntCounterVec::new(
            Opts::new(
                "tapevault_queue_messages_retried_total",
                "Queue messages given back for retry, by message type",
            ),
            &["type"],
        )?;
        let device_failures = IntCounterVec::new(
            Opts::new(
                "tapevault_device_failures_total",
                "Failed robot and drive commands, by operation",
            ),
            &["operation"],
        )?;
        let tars_sealed = IntCounter::new("tapevault_tars_sealed_total", "TAR containers sealed")?;
        let tars_written = IntCounter::new(
            "tapevault_tars_written_to_tape_total",
            "TAR containers copied onto tape",
        )?;
        let bytes_written_to_tape = IntCounter::new(
            "tapevault_bytes_written_to_tape_total",
            "Bytes of TAR containers copied onto tape",
        )?;
        let archives_staged = IntCounter::new(
            "tapevault_archives_staged_total",
            "Archives read back from tape into the archive cache",
        )?;
        let access_requests_created = IntCounter::new(
            "tapevault_access_requests_created_total",
            "Access requests created",
        )?;
        let access_requests_aborted = IntCounter::new(
            "tapevault_access_requests_aborted_total",
            "Access requests expired because an archive could not be staged",
        )?;
        let access_requests_purged = IntCounter::new(
            "tapevault_access_requests_purged_total",
            "Access requests deleted after their purge date",
        )?;
        let cache_used_bytes = IntGauge::new(
            "tapevault_archive_cache_used_bytes",
            "Bytes held or reserved in the archive cache",
        )?;
        let tapes_by_state = IntGaugeVec::new(
            Opts::new("tapevault_tapes", "Cartridges in the catalog, by state"),
            &["state"],
        )?;

        registry.register(Box::new(queue_enqueued.clone()))?;
        registry.register(Box::new(queue_claimed.clone()))?;
        registry.register(Box::new(queue_completed.clone()))?;
        registry.register(Box::new(queue_retried.clone()))?;
        registry.register(Box::new(device_failures.clone()))?;
        registry.register(Box::new(tars_sealed.clone()))?;
        registry.register(Box::new(tars_written.clone()))?;
        registry.register(Box::new(bytes_written_to_tape.clone()))?;
        registry.register(Box::new(archives_staged.clone()))?;
        registry.register(Box::new(access_requests_created.clone()))?;
        registry.register(Box::new(access_requests_purged.clone()))?;
        registry.register(Box::new(access_requests_aborted.clone()))?;
        registry.register(Box::new(cache_used_bytes.clone()))?;
        registry.register(Box::new(tapes_by_state.clone()))?;

        Ok(Self {
            registry,
            queue_enqueued,
            queue_claimed,
            queue_completed,
            queue_retried,
            device_failures,
            tars_sealed,
            tars_written,
            bytes_written_to_tape,
            archives_staged,
            access_requests_created,
            access_requests_purged,
            access_requests_aborted,
            cache_used_bytes,
            tapes_by_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_enqueued(&self, message_type: QueueMessageType) {
        self.queue_enqueued
            .with_label_values(&[message_type.as_str()])
            .inc();
    }

    pub fn record_claimed(&self, message_type: QueueMessageType) {
        self.queue_claimed
            .with_label_values(&[message_type.as_str()])
            .inc();
    }

    pub fn record_completed(&self, message_type: QueueMessageType) {
        self.queue_completed
            .with_label_values(&[message_type.as_str()])
            .inc();
    }

    pub fn record_retried(&self, message_type: QueueMessageType) {
        self.queue_retried
            .with_label_values(&[message_type.as_str()])
            .inc();
    }

    pub fn record_device_failure(&self, operation: &str) {
        self.device_failures.with_label_values(&[operation]).inc();
    }

    /// Replace the per-state tape gauges with a fresh count.
    pub fn set_tape_counts(&self, counts: &std::collections::HashMap<TapeState, u64>) {
        for state in TapeState::all() {
            let count = counts.get(&state).copied().unwrap_or(0);
            self.tapes_by_state
                .with_label_values(&[state.as_str()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Atomically rewrite `path` with the current exposition.
    pub async fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        let buffer = self.encode().map_err(std::io::Error::other)?;
        let temp = tapevault_storage::persist::temp_path_for(path);
        tokio::fs::write(&temp, buffer).await?;
        tokio::fs::rename(&temp, path).await?;
        tapevault_storage::persist::sync_parent_dir(path).await
    }
}

/// Rewrite the textfile every `interval` until shutdown.
pub fn spawn_textfile_exporter(
    metrics: Arc<OfferMetrics>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = metrics.write_textfile(&path).await {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to write metrics textfile"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        // Two instances would collide on a shared global registry.
        let first = OfferMetrics::new().unwrap();
        let second = OfferMetrics::new().unwrap();
        first.record_enqueued(QueueMessageType::WriteOrder);
        first.record_device_failure("rewind");

        let text = String::from_utf8(first.encode().unwrap()).unwrap();
        assert!(text.contains("tapevault_queue_messages_enqueued_total{type=\"WriteOrder\"} 1"));
        assert!(text.contains("tapevault_device_failures_total{operation=\"rewind\"} 1"));
        assert_eq!(second.queue_enqueued.with_label_values(&["WriteOrder"]).get(), 0);
    }

    #[tokio::test]
    async fn test_write_textfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapevault.prom");
        let metrics = OfferMetrics::new().unwrap();
        metrics.tars_sealed.inc();
        metrics.write_textfile(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("tapevault_tars_sealed_total 1"));
    }
}
