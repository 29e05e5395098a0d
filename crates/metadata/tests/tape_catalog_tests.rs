//! Tape catalog persistence.

mod common;

use common::TestMetadata;
use serde_json::{Map, Value, json};
use tapevault_core::{QueryCriteria, QueryOperator, TapeCatalog, TapeLocation, TapeState};
use tapevault_metadata::MetadataError;

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected a JSON object"),
    }
}

#[tokio::test]
async fn test_create_and_find_by_id() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let mut tape = TapeCatalog::new("TAPE01L6", 1, 1_000);
    tape.version = 12;
    store.create_tape(&tape).await.unwrap();

    let found = store.find_tape_by_id(&tape.id).await.unwrap().unwrap();
    assert_eq!(found.code, "TAPE01L6");
    assert_eq!(found.version, 0);
    assert_eq!(found.current_location, TapeLocation::Slot(1));

    assert!(store.find_tape_by_id("missing").await.unwrap().is_none());
    assert_eq!(
        store
            .find_tape_by_code("TAPE01L6")
            .await
            .unwrap()
            .unwrap()
            .id,
        tape.id
    );
}

#[tokio::test]
async fn test_duplicate_code_is_rejected() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    store
        .create_tape(&TapeCatalog::new("TAPE01L6", 1, 1_000))
        .await
        .unwrap();
    let err = store
        .create_tape(&TapeCatalog::new("TAPE01L6", 2, 1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_replace_increments_version() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let mut tape = TapeCatalog::new("TAPE01L6", 1, 1_000);
    store.create_tape(&tape).await.unwrap();

    tape.loaded_into_drive(0).unwrap();
    assert!(store.replace_tape(&tape).await.unwrap());
    assert!(store.replace_tape(&tape).await.unwrap());

    let found = store.find_tape_by_id(&tape.id).await.unwrap().unwrap();
    assert_eq!(found.version, 2);
    assert_eq!(found.current_location, TapeLocation::Drive(0));

    let unknown = TapeCatalog::new("TAPE02L6", 2, 1_000);
    assert!(!store.replace_tape(&unknown).await.unwrap());
}

#[tokio::test]
async fn test_update_applies_patch_and_version() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let tape = TapeCatalog::new("TAPE01L6", 1, 1_000);
    store.create_tape(&tape).await.unwrap();

    let patch = fields(json!({
        "state": "OPEN",
        "file_count": 3,
        "bucket": "prod",
        "current_location": {"type": "drive", "index": 1},
    }));
    assert!(store.update_tape(&tape.id, &patch).await.unwrap());

    let found = store.find_tape_by_id(&tape.id).await.unwrap().unwrap();
    assert_eq!(found.state, TapeState::Open);
    assert_eq!(found.file_count, 3);
    assert_eq!(found.bucket.as_deref(), Some("prod"));
    assert_eq!(found.current_location, TapeLocation::Drive(1));
    assert_eq!(found.version, 1);

    // The state column follows the document.
    let open = store
        .find_tapes(&[QueryCriteria::eq("state", "OPEN")])
        .await
        .unwrap();
    assert_eq!(open.len(), 1);

    assert!(!store.update_tape("missing", &patch).await.unwrap());
}

#[tokio::test]
async fn test_update_rejects_bad_arguments() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let tape = TapeCatalog::new("TAPE01L6", 1, 1_000);
    store.create_tape(&tape).await.unwrap();

    for patch in [
        Map::new(),
        fields(json!({"version": 10})),
        fields(json!({"id": "other"})),
        fields(json!({"state": "LOST"})),
        fields(json!({"no_such_field": 1})),
    ] {
        let err = store.update_tape(&tape.id, &patch).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidArgument(_)), "{err}");
    }

    let untouched = store.find_tape_by_id(&tape.id).await.unwrap().unwrap();
    assert_eq!(untouched.version, 0);
}

#[tokio::test]
async fn test_concurrent_updates_each_increment_version() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let tape = TapeCatalog::new("TAPE01L6", 1, 1_000);
    store.create_tape(&tape).await.unwrap();

    const UPDATES: i64 = 25;
    let mut handles = Vec::new();
    for i in 0..UPDATES {
        let store = store.clone();
        let id = tape.id.clone();
        handles.push(tokio::spawn(async move {
            let patch = fields(json!({ "written_bytes": i }));
            store.update_tape(&id, &patch).await.unwrap()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let found = store.find_tape_by_id(&tape.id).await.unwrap().unwrap();
    assert_eq!(found.version, UPDATES);
}

#[tokio::test]
async fn test_find_tapes_by_criteria() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let mut loaded = TapeCatalog::new("TAPE01L6", 1, 1_000);
    loaded.loaded_into_drive(0).unwrap();
    loaded.bucket = Some("prod".into());
    store.create_tape(&loaded).await.unwrap();
    store
        .create_tape(&TapeCatalog::new("TAPE02L6", 2, 1_000))
        .await
        .unwrap();
    let mut big = TapeCatalog::new("TAPE03L6", 3, 5_000);
    big.bucket = Some("prod".into());
    store.create_tape(&big).await.unwrap();

    let in_drive = store
        .find_tapes(&[QueryCriteria::eq("current_location.type", "drive")])
        .await
        .unwrap();
    assert_eq!(in_drive.len(), 1);
    assert_eq!(in_drive[0].code, "TAPE01L6");

    let prod_large = store
        .find_tapes(&[
            QueryCriteria::eq("bucket", "prod"),
            QueryCriteria::new("remaining_size", QueryOperator::Gt, 1_000),
        ])
        .await
        .unwrap();
    assert_eq!(prod_large.len(), 1);
    assert_eq!(prod_large[0].code, "TAPE03L6");

    let unassigned = store
        .find_tapes(&[QueryCriteria::eq("bucket", Value::Null)])
        .await
        .unwrap();
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].code, "TAPE02L6");

    let err = store.find_tapes(&[]).await.unwrap_err();
    assert!(matches!(err, MetadataError::InvalidArgument(_)));

    let err = store
        .find_tapes(&[QueryCriteria::eq("code') OR (1=1", "x")])
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_count_by_state() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    for (i, state) in [TapeState::Empty, TapeState::Empty, TapeState::Full]
        .into_iter()
        .enumerate()
    {
        let mut tape = TapeCatalog::new(format!("TAPE{i:02}L6"), i as u32, 1_000);
        tape.state = state;
        store.create_tape(&tape).await.unwrap();
    }

    let counts = store.count_by_state().await.unwrap();
    assert_eq!(counts.get(&TapeState::Empty), Some(&2));
    assert_eq!(counts.get(&TapeState::Full), Some(&1));
    assert_eq!(counts.get(&TapeState::Open), None);
}

#[tokio::test]
async fn test_concurrent_drive_claims_have_one_winner() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let tape = TapeCatalog::new("TAPE01L6", 3, 1_000);
    store.create_tape(&tape).await.unwrap();

    const DRIVES: u32 = 8;
    let mut handles = Vec::new();
    for drive in 0..DRIVES {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_tape_for_drive("TAPE01L6", drive).await.unwrap()
        }));
    }
    let mut winners = Vec::new();
    for handle in handles {
        if let Some(claimed) = handle.await.unwrap() {
            winners.push(claimed);
        }
    }
    assert_eq!(winners.len(), 1);
    let winner = &winners[0];
    assert!(winner.current_location.is_drive());
    assert_eq!(winner.previous_location, Some(TapeLocation::Slot(3)));
    assert_eq!(winner.home_slot(), Some(3));

    let found = store.find_tape_by_code("TAPE01L6").await.unwrap().unwrap();
    assert_eq!(found.current_location, winner.current_location);
    assert_eq!(found.version, 1);
}

#[tokio::test]
async fn test_release_checks_the_holding_drive() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    store
        .create_tape(&TapeCatalog::new("TAPE01L6", 3, 1_000))
        .await
        .unwrap();

    let err = store.release_tape_to_slot("TAPE01L6", 0, 3).await.unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));

    store.claim_tape_for_drive("TAPE01L6", 1).await.unwrap().unwrap();
    assert!(store.claim_tape_for_drive("TAPE01L6", 0).await.unwrap().is_none());
    let err = store.release_tape_to_slot("TAPE01L6", 0, 3).await.unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));

    let released = store.release_tape_to_slot("TAPE01L6", 1, 3).await.unwrap();
    assert_eq!(released.current_location, TapeLocation::Slot(3));
    assert_eq!(released.previous_location, Some(TapeLocation::Drive(1)));
    assert!(store.claim_tape_for_drive("TAPE01L6", 0).await.unwrap().is_some());

    assert!(matches!(
        store.claim_tape_for_drive("MISSING", 0).await,
        Err(MetadataError::NotFound(_))
    ));
}
