//! Work queue repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use tapevault_core::{QueryCriteria, QueueMessage, QueueMessageType, QueueState, QueueUpdate};
use uuid::Uuid;

/// Persistent priority queue shared by write and read orders.
///
/// A claim flips exactly one `READY` message to `RUNNING` in a single
/// conditional update, so two claimants never receive the same message.
/// Claims never block: `None` means nothing qualified right now.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// Enqueue unconditionally.
    async fn add(&self, message: &QueueMessage) -> MetadataResult<()>;

    /// Enqueue unless a message of the same type matching `natural_key`
    /// exists. Returns whether the message was inserted.
    async fn add_if_absent(
        &self,
        natural_key: &[QueryCriteria],
        message: &QueueMessage,
    ) -> MetadataResult<bool>;

    /// Claim the next `READY` message of `message_type`.
    ///
    /// With `use_priority`, the smallest priority wins and insertion order
    /// breaks ties; without it, insertion order alone decides.
    async fn receive(
        &self,
        message_type: QueueMessageType,
        use_priority: bool,
    ) -> MetadataResult<Option<QueueMessage>> {
        self.receive_with(&[], &[], message_type, use_priority).await
    }

    /// Claim restricted by `filter`, applying `update` to the claimed message
    /// in the same statement.
    async fn receive_with(
        &self,
        filter: &[QueryCriteria],
        update: &[QueueUpdate],
        message_type: QueueMessageType,
        use_priority: bool,
    ) -> MetadataResult<Option<QueueMessage>>;

    /// Terminal success: delete the message. Returns whether it existed.
    async fn complete(&self, id: Uuid) -> MetadataResult<bool>;

    /// Abort: delete regardless of state. Returns whether it existed.
    async fn remove(&self, id: Uuid) -> MetadataResult<bool>;

    /// Give a `RUNNING` message back for retry. Returns whether it was running.
    async fn mark_ready(&self, id: Uuid) -> MetadataResult<bool>;

    async fn get_message(&self, id: Uuid) -> MetadataResult<Option<QueueMessage>>;

    async fn count_messages(
        &self,
        message_type: QueueMessageType,
        state: Option<QueueState>,
    ) -> MetadataResult<u64>;

    /// Return every `RUNNING` message to `READY`.
    ///
    /// Only valid at startup, before any worker of this offer is claiming.
    async fn requeue_running(&self) -> MetadataResult<u64>;
}
