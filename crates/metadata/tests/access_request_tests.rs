//! Access request persistence and staging transitions.

mod common;

use common::TestMetadata;
use tapevault_core::AccessRequestStatus;
use tapevault_metadata::models::{AccessRequestRow, RequestedArchive};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

fn request(container: &str, names: &[&str]) -> AccessRequestRow {
    AccessRequestRow {
        request_id: Uuid::new_v4(),
        container: container.to_string(),
        object_names: serde_json::to_string(names).unwrap(),
        creation_date: OffsetDateTime::now_utc(),
        ready_date: None,
        expiration_date: None,
        purge_date: None,
    }
}

fn archive(id: &str, staged: bool) -> RequestedArchive {
    RequestedArchive {
        archive_id: id.to_string(),
        staged,
    }
}

#[tokio::test]
async fn test_request_becomes_ready_when_last_archive_is_staged() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let row = request("0_object", &["o1", "o2"]);
    store
        .insert_access_request(&row, &[archive("a.tar", false), archive("b.tar", false)])
        .await
        .unwrap();
    assert_eq!(
        store.pending_archive_ids().await.unwrap().len(),
        2
    );

    let now = OffsetDateTime::now_utc();
    let ready = store
        .mark_archive_staged("a.tar", now, Duration::hours(1), Duration::days(1))
        .await
        .unwrap();
    assert!(ready.is_empty());

    let records = store.find_access_requests(&[row.request_id]).await.unwrap();
    assert_eq!(records[0].unavailable_archive_ids, ["b.tar"]);
    assert_eq!(records[0].staged_archive_ids, ["a.tar"]);
    assert_eq!(records[0].status(now), AccessRequestStatus::Pending);
    assert_eq!(records[0].object_names().unwrap(), ["o1", "o2"]);

    let ready = store
        .mark_archive_staged("b.tar", now, Duration::hours(1), Duration::days(1))
        .await
        .unwrap();
    assert_eq!(ready, [row.request_id]);

    let records = store.find_access_requests(&[row.request_id]).await.unwrap();
    assert_eq!(records[0].status(now), AccessRequestStatus::Ready);
    assert_eq!(
        records[0].status(now + Duration::hours(2)),
        AccessRequestStatus::Expired
    );

    // Staging again is a no-op.
    let ready = store
        .mark_archive_staged("b.tar", now, Duration::hours(1), Duration::days(1))
        .await
        .unwrap();
    assert!(ready.is_empty());
}

#[tokio::test]
async fn test_locked_archives_follow_request_lifetime() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    let pending = request("c", &["o1"]);
    store
        .insert_access_request(&pending, &[archive("a.tar", true), archive("b.tar", false)])
        .await
        .unwrap();

    let mut expired = request("c", &["o2"]);
    expired.ready_date = Some(now - Duration::hours(3));
    expired.expiration_date = Some(now - Duration::hours(2));
    expired.purge_date = Some(now - Duration::hours(1));
    store
        .insert_access_request(&expired, &[archive("c.tar", true)])
        .await
        .unwrap();

    let locked = store.locked_archive_ids(now).await.unwrap();
    assert!(locked.contains("a.tar"));
    assert!(!locked.contains("b.tar"));
    assert!(!locked.contains("c.tar"));

    assert_eq!(store.purge_access_requests(now).await.unwrap(), 1);
    assert!(
        store
            .find_access_requests(&[expired.request_id])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_delete_is_idempotent_and_cascades() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let row = request("c", &["o1"]);
    store
        .insert_access_request(&row, &[archive("a.tar", false)])
        .await
        .unwrap();

    assert!(store.delete_access_request(row.request_id).await.unwrap());
    assert!(!store.delete_access_request(row.request_id).await.unwrap());
    assert!(store.pending_archive_ids().await.unwrap().is_empty());

    let unknown = store
        .find_access_requests(&[Uuid::new_v4()])
        .await
        .unwrap();
    assert!(unknown.is_empty());
}

#[tokio::test]
async fn test_aborted_staging_expires_waiting_requests() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    let waiting = request("c", &["o1", "o2"]);
    store
        .insert_access_request(&waiting, &[archive("a.tar", true), archive("b.tar", false)])
        .await
        .unwrap();
    let other = request("c", &["o3"]);
    store
        .insert_access_request(&other, &[archive("c.tar", false)])
        .await
        .unwrap();
    assert!(store.locked_archive_ids(now).await.unwrap().contains("a.tar"));

    let aborted = store
        .abort_archive_staging("b.tar", now, Duration::days(1))
        .await
        .unwrap();
    assert_eq!(aborted, [waiting.request_id]);

    let records = store.find_access_requests(&[waiting.request_id]).await.unwrap();
    assert_eq!(records[0].status(now), AccessRequestStatus::Expired);
    assert_eq!(records[0].row.purge_date, Some(now + Duration::days(1)));
    // Archives staged for it are no longer protected from eviction.
    assert!(!store.locked_archive_ids(now).await.unwrap().contains("a.tar"));

    let records = store.find_access_requests(&[other.request_id]).await.unwrap();
    assert_eq!(records[0].status(now), AccessRequestStatus::Pending);

    // Already expired: aborting again changes nothing.
    let again = store
        .abort_archive_staging("b.tar", now + Duration::hours(1), Duration::days(1))
        .await
        .unwrap();
    assert!(again.is_empty());

    assert_eq!(
        store
            .purge_access_requests(now + Duration::days(1))
            .await
            .unwrap(),
        1
    );
    assert!(
        store
            .find_access_requests(&[waiting.request_id])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_pending_request_purged_after_its_horizon() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    let mut pending = request("c", &["o1"]);
    pending.purge_date = Some(now + Duration::days(7));
    store
        .insert_access_request(&pending, &[archive("a.tar", true), archive("b.tar", false)])
        .await
        .unwrap();

    assert_eq!(store.purge_access_requests(now).await.unwrap(), 0);
    assert!(
        store
            .locked_archive_ids(now + Duration::days(6))
            .await
            .unwrap()
            .contains("a.tar")
    );

    assert_eq!(
        store
            .purge_access_requests(now + Duration::days(7))
            .await
            .unwrap(),
        1
    );
    assert!(store.pending_archive_ids().await.unwrap().is_empty());
    assert!(
        store
            .locked_archive_ids(now + Duration::days(7))
            .await
            .unwrap()
            .is_empty()
    );
}
