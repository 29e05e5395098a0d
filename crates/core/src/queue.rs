//! Work queue messages shared by write and read tape operations.
//!
//! Every message kind lives in one collection and is discriminated by its
//! `type` tag, so claim semantics are identical for all of them.

use crate::criteria::QueryCriteria;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Priority assigned when the producer does not set one.
///
/// Smaller numbers are served first, so unprioritized messages sit in the
/// most urgent tier and explicitly deferred work uses larger numbers.
pub const DEFAULT_PRIORITY: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueState {
    Ready,
    Running,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
        }
    }
}

impl FromStr for QueueState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "READY" => Ok(Self::Ready),
            "RUNNING" => Ok(Self::Running),
            other => Err(crate::Error::Serialization(format!(
                "unknown queue state: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMessageType {
    WriteOrder,
    WriteBackupOrder,
    ReadOrder,
}

impl QueueMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteOrder => "WriteOrder",
            Self::WriteBackupOrder => "WriteBackupOrder",
            Self::ReadOrder => "ReadOrder",
        }
    }
}

impl fmt::Display for QueueMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMessageType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "WriteOrder" => Ok(Self::WriteOrder),
            "WriteBackupOrder" => Ok(Self::WriteBackupOrder),
            "ReadOrder" => Ok(Self::ReadOrder),
            other => Err(crate::Error::Serialization(format!(
                "unknown queue message type: {other}"
            ))),
        }
    }
}

/// A sealed TAR on disk waiting to be copied onto tape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOrder {
    pub bucket: String,
    pub file_bucket_id: String,
    /// Absolute path of the TAR file on disk.
    pub file_path: String,
    pub size: u64,
    pub digest: String,
    /// TAR identifier (file name).
    pub archive_id: String,
}

/// A tape-resident TAR that must be staged to disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOrder {
    pub tape_code: String,
    /// File mark index of the TAR on the tape.
    pub file_position: u32,
    /// TAR identifier.
    pub file_name: String,
    pub bucket: String,
    pub file_bucket_id: String,
    pub size: u64,
}

/// Type-specific payload, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueueOrder {
    WriteOrder(WriteOrder),
    WriteBackupOrder(WriteOrder),
    ReadOrder(ReadOrder),
}

impl QueueOrder {
    pub fn message_type(&self) -> QueueMessageType {
        match self {
            Self::WriteOrder(_) => QueueMessageType::WriteOrder,
            Self::WriteBackupOrder(_) => QueueMessageType::WriteBackupOrder,
            Self::ReadOrder(_) => QueueMessageType::ReadOrder,
        }
    }

    /// Fields identifying the same unit of work across duplicate submissions.
    pub fn natural_key(&self) -> Vec<QueryCriteria> {
        match self {
            Self::WriteOrder(order) | Self::WriteBackupOrder(order) => vec![
                QueryCriteria::eq("bucket", order.bucket.as_str()),
                QueryCriteria::eq("file_bucket_id", order.file_bucket_id.as_str()),
                QueryCriteria::eq("file_path", order.file_path.as_str()),
            ],
            Self::ReadOrder(order) => vec![
                QueryCriteria::eq("file_name", order.file_name.as_str()),
                QueryCriteria::eq("tape_code", order.tape_code.as_str()),
            ],
        }
    }
}

/// A persisted queue message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub state: QueueState,
    pub priority: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub order: QueueOrder,
}

impl QueueMessage {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: QueueState::Ready,
            priority: DEFAULT_PRIORITY,
            created_at: OffsetDateTime::now_utc(),
            order,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn message_type(&self) -> QueueMessageType {
        self.order.message_type()
    }
}

/// Patch applied to a message as part of an atomic claim.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueUpdate {
    SetPriority(i32),
    /// Overwrite one payload field.
    SetField { field: String, value: Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_order() -> WriteOrder {
        WriteOrder {
            bucket: "bucket".into(),
            file_bucket_id: "objects".into(),
            file_path: "/tars/a.tar".into(),
            size: 10,
            digest: "abc".into(),
            archive_id: "a.tar".into(),
        }
    }

    #[test]
    fn test_order_is_tagged_by_type() {
        let json = serde_json::to_value(QueueOrder::WriteBackupOrder(write_order())).unwrap();
        assert_eq!(json["type"], "WriteBackupOrder");
        assert_eq!(json["bucket"], "bucket");

        let back: QueueOrder = serde_json::from_value(json).unwrap();
        assert_eq!(back.message_type(), QueueMessageType::WriteBackupOrder);
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = QueueMessage::new(QueueOrder::WriteOrder(write_order()));
        assert_eq!(msg.state, QueueState::Ready);
        assert_eq!(msg.priority, DEFAULT_PRIORITY);
        assert_eq!(msg.with_priority(3).priority, 3);
    }

    #[test]
    fn test_write_natural_key() {
        let key = QueueOrder::WriteOrder(write_order()).natural_key();
        let fields: Vec<_> = key.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, ["bucket", "file_bucket_id", "file_path"]);
    }
}
