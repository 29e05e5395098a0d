//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use tapevault_core::{
    AccessRequestId, AccessRequestStatus, ArchiveLocation, ArchiveLocationType, DigestType,
    ObjectLocation, QueueMessage, QueueOrder, QueueState, TapeCatalog,
};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Tape catalog
// =============================================================================

/// Tape catalog record: indexed columns plus the full JSON document.
#[derive(Debug, Clone, FromRow)]
pub struct TapeRow {
    pub id: String,
    pub code: String,
    pub state: String,
    pub version: i64,
    pub document: String,
}

impl TapeRow {
    pub fn from_tape(tape: &TapeCatalog) -> MetadataResult<Self> {
        Ok(Self {
            id: tape.id.clone(),
            code: tape.code.clone(),
            state: tape.state.as_str().to_string(),
            version: tape.version,
            document: serde_json::to_string(tape)?,
        })
    }

    /// The `version` column is authoritative over the copy inside the document.
    pub fn into_tape(self) -> MetadataResult<TapeCatalog> {
        let mut tape: TapeCatalog = serde_json::from_str(&self.document)?;
        tape.id = self.id;
        tape.version = self.version;
        Ok(tape)
    }
}

// =============================================================================
// Work queue
// =============================================================================

/// Queue message record. `seq` gives strict insertion order.
#[derive(Debug, Clone, FromRow)]
pub struct QueueMessageRow {
    pub seq: i64,
    pub id: Uuid,
    pub message_type: String,
    pub state: String,
    pub priority: i64,
    pub created_at: OffsetDateTime,
    pub payload: String,
}

impl QueueMessageRow {
    pub fn into_message(self) -> MetadataResult<QueueMessage> {
        let order: QueueOrder = serde_json::from_str(&self.payload)?;
        let state: QueueState = self.state.parse()?;
        let priority = i32::try_from(self.priority).map_err(|_| {
            MetadataError::Serialization(format!("priority out of range: {}", self.priority))
        })?;
        Ok(QueueMessage {
            id: self.id,
            state,
            priority,
            created_at: self.created_at,
            order,
        })
    }
}

// =============================================================================
// Archive referential
// =============================================================================

/// One TAR container and its current location.
#[derive(Debug, Clone, FromRow)]
pub struct ArchiveRow {
    pub archive_id: String,
    pub bucket: String,
    pub file_bucket_id: String,
    pub location: String,
    pub tape_code: Option<String>,
    pub file_position: Option<i64>,
    pub size: Option<i64>,
    pub digest: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ArchiveRow {
    /// A TAR that has just been opened for appending.
    pub fn building(
        archive_id: impl Into<String>,
        bucket: impl Into<String>,
        file_bucket_id: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            archive_id: archive_id.into(),
            bucket: bucket.into(),
            file_bucket_id: file_bucket_id.into(),
            location: ArchiveLocationType::BuildingOnDisk.as_str().to_string(),
            tape_code: None,
            file_position: None,
            size: None,
            digest: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn location(&self) -> MetadataResult<ArchiveLocation> {
        let location_type: ArchiveLocationType = self.location.parse()?;
        Ok(match location_type {
            ArchiveLocationType::BuildingOnDisk => ArchiveLocation::BuildingOnDisk,
            ArchiveLocationType::ReadyOnDisk => ArchiveLocation::ReadyOnDisk,
            ArchiveLocationType::OnTape => {
                let (Some(tape_code), Some(file_position)) =
                    (self.tape_code.clone(), self.file_position)
                else {
                    return Err(MetadataError::Serialization(format!(
                        "archive {} is on tape without a tape position",
                        self.archive_id
                    )));
                };
                ArchiveLocation::OnTape {
                    tape_code,
                    file_position: u32::try_from(file_position).map_err(|_| {
                        MetadataError::Serialization(format!(
                            "invalid file position {file_position}"
                        ))
                    })?,
                }
            }
        })
    }
}

// =============================================================================
// Object referential
// =============================================================================

/// Stored object and where its bytes are.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub container: String,
    pub object_name: String,
    /// Identifies one write of the object; a rewrite gets a new one.
    pub storage_id: String,
    pub size: i64,
    pub digest: String,
    pub digest_type: String,
    pub location: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ObjectRow {
    pub fn new(
        container: impl Into<String>,
        object_name: impl Into<String>,
        storage_id: impl Into<String>,
        size: u64,
        digest: impl Into<String>,
        digest_type: DigestType,
        location: &ObjectLocation,
    ) -> MetadataResult<Self> {
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            container: container.into(),
            object_name: object_name.into(),
            storage_id: storage_id.into(),
            size: to_i64(size)?,
            digest: digest.into(),
            digest_type: digest_type.as_str().to_string(),
            location: serde_json::to_string(location)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn location(&self) -> MetadataResult<ObjectLocation> {
        Ok(serde_json::from_str(&self.location)?)
    }

    pub fn digest_type(&self) -> MetadataResult<DigestType> {
        Ok(self.digest_type.parse()?)
    }

    pub fn size(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }
}

// =============================================================================
// Access requests
// =============================================================================

/// Access request record.
#[derive(Debug, Clone, FromRow)]
pub struct AccessRequestRow {
    pub request_id: Uuid,
    pub container: String,
    /// JSON array of object names.
    pub object_names: String,
    pub creation_date: OffsetDateTime,
    pub ready_date: Option<OffsetDateTime>,
    pub expiration_date: Option<OffsetDateTime>,
    pub purge_date: Option<OffsetDateTime>,
}

/// Access request with the archives it waits for.
#[derive(Debug, Clone)]
pub struct AccessRequestRecord {
    pub row: AccessRequestRow,
    /// Archives not staged yet.
    pub unavailable_archive_ids: Vec<String>,
    /// Archives already staged (and protected from cache eviction).
    pub staged_archive_ids: Vec<String>,
}

impl AccessRequestRecord {
    pub fn id(&self) -> AccessRequestId {
        AccessRequestId::from(self.row.request_id)
    }

    pub fn object_names(&self) -> MetadataResult<Vec<String>> {
        Ok(serde_json::from_str(&self.row.object_names)?)
    }

    /// An expiration date in the past wins over missing archives: a request
    /// whose archive could not be staged is expired without becoming ready.
    pub fn status(&self, now: OffsetDateTime) -> AccessRequestStatus {
        if let Some(expiration) = self.row.expiration_date
            && expiration <= now
        {
            return AccessRequestStatus::Expired;
        }
        if !self.unavailable_archive_ids.is_empty() || self.row.ready_date.is_none() {
            AccessRequestStatus::Pending
        } else {
            AccessRequestStatus::Ready
        }
    }
}

/// Archive attached to a new access request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedArchive {
    pub archive_id: String,
    /// Already on disk or in the cache when the request was created.
    pub staged: bool,
}

pub(crate) fn to_i64(value: u64) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::InvalidArgument(format!("value {value} exceeds i64")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        unavailable: &[&str],
        ready: Option<OffsetDateTime>,
        expiration: Option<OffsetDateTime>,
    ) -> AccessRequestRecord {
        AccessRequestRecord {
            row: AccessRequestRow {
                request_id: Uuid::new_v4(),
                container: "c".into(),
                object_names: "[\"o\"]".into(),
                creation_date: OffsetDateTime::now_utc(),
                ready_date: ready,
                expiration_date: expiration,
                purge_date: None,
            },
            unavailable_archive_ids: unavailable.iter().map(|s| s.to_string()).collect(),
            staged_archive_ids: Vec::new(),
        }
    }

    #[test]
    fn test_access_request_status() {
        let now = OffsetDateTime::now_utc();
        let hour = time::Duration::hours(1);

        assert_eq!(
            record(&["tar1"], None, None).status(now),
            AccessRequestStatus::Pending
        );
        assert_eq!(
            record(&[], Some(now), Some(now + hour)).status(now),
            AccessRequestStatus::Ready
        );
        assert_eq!(
            record(&[], Some(now - hour - hour), Some(now - hour)).status(now),
            AccessRequestStatus::Expired
        );
        // Given up on before its archive was staged.
        assert_eq!(
            record(&["tar1"], None, Some(now)).status(now),
            AccessRequestStatus::Expired
        );
        assert_eq!(
            record(&["tar1"], None, Some(now + hour)).status(now),
            AccessRequestStatus::Pending
        );
    }

    #[test]
    fn test_tape_row_version_column_wins() {
        let mut tape = TapeCatalog::new("TAPE01", 1, 100);
        tape.version = 0;
        let mut row = TapeRow::from_tape(&tape).unwrap();
        row.version = 7;
        assert_eq!(row.into_tape().unwrap().version, 7);
    }

    #[test]
    fn test_archive_on_tape_requires_position() {
        let mut row = ArchiveRow::building("t.tar", "b", "fb");
        row.location = "ON_TAPE".into();
        assert!(row.location().is_err());
        row.tape_code = Some("TAPE01".into());
        row.file_position = Some(2);
        assert_eq!(
            row.location().unwrap(),
            ArchiveLocation::OnTape {
                tape_code: "TAPE01".into(),
                file_position: 2
            }
        );
    }
}
