//! TAR entry descriptors and archive/object locations.

use crate::digest::DigestType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position of one object inside a TAR container.
///
/// `start_pos` is the offset of the first data byte (after the entry header).
/// `start_pos + size` always lies within the durable part of the container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarEntryDescription {
    pub tar_id: String,
    pub entry_name: String,
    pub start_pos: u64,
    pub size: u64,
    pub digest: String,
    pub digest_type: DigestType,
}

impl TarEntryDescription {
    pub fn end_pos(&self) -> u64 {
        self.start_pos + self.size
    }
}

/// Where a TAR currently lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveLocation {
    /// Still receiving entries.
    BuildingOnDisk,
    /// Sealed, waiting for a drive worker.
    ReadyOnDisk,
    /// Copied to tape at file mark `file_position`.
    OnTape { tape_code: String, file_position: u32 },
}

/// Discriminant of [`ArchiveLocation`] as stored in the referential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveLocationType {
    BuildingOnDisk,
    ReadyOnDisk,
    OnTape,
}

impl ArchiveLocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildingOnDisk => "BUILDING_ON_DISK",
            Self::ReadyOnDisk => "READY_ON_DISK",
            Self::OnTape => "ON_TAPE",
        }
    }
}

impl fmt::Display for ArchiveLocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveLocationType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "BUILDING_ON_DISK" => Ok(Self::BuildingOnDisk),
            "READY_ON_DISK" => Ok(Self::ReadyOnDisk),
            "ON_TAPE" => Ok(Self::OnTape),
            other => Err(crate::Error::Serialization(format!(
                "unknown archive location: {other}"
            ))),
        }
    }
}

impl ArchiveLocation {
    pub fn location_type(&self) -> ArchiveLocationType {
        match self {
            Self::BuildingOnDisk => ArchiveLocationType::BuildingOnDisk,
            Self::ReadyOnDisk => ArchiveLocationType::ReadyOnDisk,
            Self::OnTape { .. } => ArchiveLocationType::OnTape,
        }
    }

    pub fn is_on_disk(&self) -> bool {
        !matches!(self, Self::OnTape { .. })
    }
}

/// Where the bytes of a stored object currently are.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectLocation {
    /// Plain file in the input files directory, not yet packed.
    InputFile,
    /// Packed into one or more TAR entries, in order.
    Tar { entries: Vec<TarEntryDescription> },
}
