//! Access request repository.

use crate::error::MetadataResult;
use crate::models::{AccessRequestRecord, AccessRequestRow, RequestedArchive};
use async_trait::async_trait;
use std::collections::HashSet;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[async_trait]
pub trait AccessRequestRepo: Send + Sync {
    /// Insert a request and the archives it depends on.
    ///
    /// A request whose archives are all staged must carry its ready,
    /// expiration and purge dates already. A pending request carries a purge
    /// date too, so one whose archives never get staged is eventually purged.
    async fn insert_access_request(
        &self,
        request: &AccessRequestRow,
        archives: &[RequestedArchive],
    ) -> MetadataResult<()>;

    /// Requests with the given ids; unknown ids are skipped.
    async fn find_access_requests(
        &self,
        request_ids: &[Uuid],
    ) -> MetadataResult<Vec<AccessRequestRecord>>;

    /// Delete a request. Returns whether it existed.
    async fn delete_access_request(&self, request_id: Uuid) -> MetadataResult<bool>;

    /// Mark `archive_id` as staged for every request waiting for it.
    ///
    /// Requests left with no pending archive become ready at `now` and get
    /// their expiration and purge dates. Returns the ids of those requests.
    async fn mark_archive_staged(
        &self,
        archive_id: &str,
        now: OffsetDateTime,
        expiration_delay: Duration,
        purge_delay: Duration,
    ) -> MetadataResult<Vec<Uuid>>;

    /// Expire every request still waiting for `archive_id`, which can no
    /// longer be staged. Their purge date becomes `now + purge_delay`.
    /// Returns the ids of those requests.
    async fn abort_archive_staging(
        &self,
        archive_id: &str,
        now: OffsetDateTime,
        purge_delay: Duration,
    ) -> MetadataResult<Vec<Uuid>>;

    /// Archives that must not be evicted: staged for a request that has not
    /// expired yet.
    async fn locked_archive_ids(&self, now: OffsetDateTime) -> MetadataResult<HashSet<String>>;

    /// Archives some request still waits for.
    async fn pending_archive_ids(&self) -> MetadataResult<HashSet<String>>;

    /// Delete requests whose purge date is past, pending ones included.
    /// Returns how many.
    async fn purge_access_requests(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}
