//! Work queue claim semantics.

mod common;

use common::{TestMetadata, archive_id, read_message, write_message};
use std::collections::HashSet;
use tapevault_core::{
    QueryCriteria, QueueMessage, QueueMessageType, QueueOrder, QueueState, QueueUpdate,
};

#[tokio::test]
async fn test_receive_empty_queue_returns_none() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let claimed = store
        .receive(QueueMessageType::WriteOrder, true)
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn test_receive_flips_to_running_and_filters_by_type() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    store.add(&read_message("TAPE01", "r.tar", 1)).await.unwrap();
    let write = write_message("bucket", "w.tar");
    store.add(&write).await.unwrap();

    let claimed = store
        .receive(QueueMessageType::WriteOrder, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, write.id);
    assert_eq!(claimed.state, QueueState::Running);
    assert_eq!(claimed.order, write.order);

    // A RUNNING message is not claimable again.
    assert!(
        store
            .receive(QueueMessageType::WriteOrder, false)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        store
            .count_messages(QueueMessageType::ReadOrder, Some(QueueState::Ready))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_priority_order_versus_insertion_order() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let low = write_message("bucket", "p2.tar").with_priority(2);
    let high = write_message("bucket", "p1.tar").with_priority(1);
    store.add(&low).await.unwrap();
    store.add(&high).await.unwrap();

    let first = store
        .receive(QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    let second = store
        .receive(QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.priority, 1);
    assert_eq!(second.priority, 2);

    // Same data, priority disabled: strictly insertion order.
    store.mark_ready(first.id).await.unwrap();
    store.mark_ready(second.id).await.unwrap();
    let first = store
        .receive(QueueMessageType::WriteOrder, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, low.id);
}

#[tokio::test]
async fn test_receive_with_filter_and_update() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let first = write_message("myBucket", "myArchiveId1").with_priority(2);
    let second = write_message("myBucket2", "myArchiveId2").with_priority(2);
    let third = write_message("myBucket2", "myArchiveId3");
    for message in [&first, &second, &third] {
        store.add(message).await.unwrap();
    }

    let filter = [QueryCriteria::eq("bucket", "myBucket2")];
    let update = [QueueUpdate::SetPriority(5)];

    let claimed = store
        .receive_with(&filter, &update, QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archive_id(&claimed.order), "myArchiveId3");
    assert_eq!(claimed.priority, 5);

    store.mark_ready(claimed.id).await.unwrap();
    let claimed = store
        .receive_with(&filter, &update, QueueMessageType::WriteOrder, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archive_id(&claimed.order), "myArchiveId2");
}

#[tokio::test]
async fn test_receive_with_field_update_patches_payload() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    store.add(&write_message("bucket", "a.tar")).await.unwrap();

    let update = [QueueUpdate::SetField {
        field: "size".to_string(),
        value: 42.into(),
    }];
    let claimed = store
        .receive_with(&[], &update, QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    let QueueOrder::WriteOrder(order) = claimed.order else {
        panic!("unexpected order type");
    };
    assert_eq!(order.size, 42);
}

#[tokio::test]
async fn test_type_tag_cannot_be_patched() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let update = [QueueUpdate::SetField {
        field: "type".to_string(),
        value: "ReadOrder".into(),
    }];
    assert!(
        store
            .receive_with(&[], &update, QueueMessageType::WriteOrder, true)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_complete_remove_and_mark_ready() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let message = write_message("bucket", "a.tar");
    store.add(&message).await.unwrap();

    // Completing or re-readying a message nobody holds does nothing.
    assert!(!store.complete(message.id).await.unwrap());
    assert!(!store.mark_ready(message.id).await.unwrap());

    let claimed = store
        .receive(QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    assert!(store.mark_ready(claimed.id).await.unwrap());
    assert_eq!(
        store.get_message(claimed.id).await.unwrap().unwrap().state,
        QueueState::Ready
    );

    let claimed = store
        .receive(QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    assert!(store.complete(claimed.id).await.unwrap());
    assert!(store.get_message(claimed.id).await.unwrap().is_none());

    let other = write_message("bucket", "b.tar");
    store.add(&other).await.unwrap();
    assert!(store.remove(other.id).await.unwrap());
    assert!(!store.remove(other.id).await.unwrap());
}

#[tokio::test]
async fn test_add_if_absent_collapses_duplicates() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let message = write_message("bucket", "a.tar");
    let duplicate = QueueMessage::new(message.order.clone());
    let key = message.order.natural_key();

    assert!(store.add_if_absent(&key, &message).await.unwrap());
    assert!(!store.add_if_absent(&key, &duplicate).await.unwrap());

    assert_eq!(
        store
            .count_messages(QueueMessageType::WriteOrder, Some(QueueState::Ready))
            .await
            .unwrap(),
        1
    );

    // Same natural key under another message type is a different job.
    let backup = QueueMessage::new(match message.order.clone() {
        QueueOrder::WriteOrder(order) => QueueOrder::WriteBackupOrder(order),
        other => other,
    });
    assert!(store.add_if_absent(&key, &backup).await.unwrap());
}

#[tokio::test]
async fn test_add_if_absent_requires_key() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    assert!(
        store
            .add_if_absent(&[], &write_message("bucket", "a.tar"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_concurrent_receivers_never_share_a_message() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    const MESSAGES: usize = 20;
    const RECEIVERS: usize = 32;
    for i in 0..MESSAGES {
        store
            .add(&write_message("bucket", &format!("{i}.tar")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..RECEIVERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .receive(QueueMessageType::WriteOrder, true)
                .await
                .unwrap()
                .map(|m| m.id)
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            claimed.push(id);
        }
    }

    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), MESSAGES.min(RECEIVERS));
    assert_eq!(distinct.len(), claimed.len());
}

#[tokio::test]
async fn test_requeue_running() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    store.add(&write_message("bucket", "a.tar")).await.unwrap();
    store.add(&write_message("bucket", "b.tar")).await.unwrap();

    store
        .receive(QueueMessageType::WriteOrder, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.requeue_running().await.unwrap(), 1);
    assert_eq!(
        store
            .count_messages(QueueMessageType::WriteOrder, Some(QueueState::Ready))
            .await
            .unwrap(),
        2
    );
}
