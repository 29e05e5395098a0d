//! Tape cartridge model: lifecycle state, physical location and usage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a cartridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TapeState {
    /// Registered, never written.
    Empty,
    /// Holds at least one file and accepts more.
    Open,
    /// No more files will be appended.
    Full,
    /// Physical position or content is not trusted anymore.
    Conflict,
    /// Taken out of service. Terminal.
    Retired,
}

impl TapeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Open => "OPEN",
            Self::Full => "FULL",
            Self::Conflict => "CONFLICT",
            Self::Retired => "RETIRED",
        }
    }

    /// Whether a new file may be appended to a tape in this state.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Empty | Self::Open)
    }

    pub fn all() -> [TapeState; 5] {
        [
            Self::Empty,
            Self::Open,
            Self::Full,
            Self::Conflict,
            Self::Retired,
        ]
    }
}

impl fmt::Display for TapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TapeState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        TapeState::all()
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::Error::Serialization(format!("unknown tape state: {s}")))
    }
}

/// Where a cartridge physically sits inside the library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "index", rename_all = "snake_case")]
pub enum TapeLocation {
    Slot(u32),
    Drive(u32),
    ImportExport(u32),
}

impl TapeLocation {
    pub fn index(&self) -> u32 {
        match self {
            Self::Slot(i) | Self::Drive(i) | Self::ImportExport(i) => *i,
        }
    }

    pub fn is_drive(&self) -> bool {
        matches!(self, Self::Drive(_))
    }
}

impl fmt::Display for TapeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(i) => write!(f, "slot {i}"),
            Self::Drive(i) => write!(f, "drive {i}"),
            Self::ImportExport(i) => write!(f, "import/export {i}"),
        }
    }
}

/// A cartridge registered in the tape catalog.
///
/// Serialized field names are the keys accepted by partial catalog updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapeCatalog {
    pub id: String,
    /// Barcode read by the robot.
    pub code: String,
    #[serde(default)]
    pub alternative_code: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default)]
    pub tape_type: Option<String>,
    /// Nominal capacity in bytes.
    pub capacity: u64,
    pub remaining_size: u64,
    #[serde(default)]
    pub written_bytes: u64,
    /// Number of files (file marks) written so far.
    #[serde(default)]
    pub file_count: u32,
    pub state: TapeState,
    pub current_location: TapeLocation,
    #[serde(default)]
    pub previous_location: Option<TapeLocation>,
    /// Bucket the tape is dedicated to once written.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub version: i64,
}

impl TapeCatalog {
    /// New empty cartridge sitting in a slot.
    pub fn new(code: impl Into<String>, slot: u32, capacity: u64) -> Self {
        let code = code.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            alternative_code: None,
            label: None,
            library: None,
            tape_type: None,
            capacity,
            remaining_size: capacity,
            written_bytes: 0,
            file_count: 0,
            state: TapeState::Empty,
            current_location: TapeLocation::Slot(slot),
            previous_location: None,
            bucket: None,
            compressed: false,
            version: 0,
        }
    }

    /// Record a robot transfer of this cartridge into `drive`.
    pub fn loaded_into_drive(&mut self, drive: u32) -> crate::Result<()> {
        match self.current_location {
            TapeLocation::Slot(_) | TapeLocation::ImportExport(_) => {
                self.previous_location = Some(self.current_location);
                self.current_location = TapeLocation::Drive(drive);
                Ok(())
            }
            TapeLocation::Drive(current) => Err(crate::Error::TapeTransition(format!(
                "tape {} is already loaded in drive {current}",
                self.code
            ))),
        }
    }

    /// Record a robot transfer of this cartridge from `drive` back to `slot`.
    pub fn unloaded_to_slot(&mut self, drive: u32, slot: u32) -> crate::Result<()> {
        match self.current_location {
            TapeLocation::Drive(current) if current == drive => {
                self.previous_location = Some(self.current_location);
                self.current_location = TapeLocation::Slot(slot);
                Ok(())
            }
            other => Err(crate::Error::TapeTransition(format!(
                "tape {} cannot be unloaded from drive {drive}: it is in {other}",
                self.code
            ))),
        }
    }

    /// Slot the cartridge should return to when unloaded.
    pub fn home_slot(&self) -> Option<u32> {
        match (self.current_location, self.previous_location) {
            (TapeLocation::Slot(s), _) => Some(s),
            (TapeLocation::Drive(_), Some(TapeLocation::Slot(s))) => Some(s),
            _ => None,
        }
    }

    /// Account for one more file of `bytes` appended at end of data.
    pub fn record_file_written(&mut self, bytes: u64) -> crate::Result<()> {
        if !self.state.is_writable() {
            return Err(crate::Error::TapeTransition(format!(
                "tape {} is {} and cannot be written",
                self.code, self.state
            )));
        }
        self.state = TapeState::Open;
        self.file_count += 1;
        self.written_bytes += bytes;
        self.remaining_size = self.remaining_size.saturating_sub(bytes);
        Ok(())
    }

    /// Whether `bytes` more would still fit on this cartridge.
    pub fn can_hold(&self, bytes: u64) -> bool {
        self.state.is_writable() && self.remaining_size >= bytes
    }

    pub fn mark_full(&mut self) {
        if self.state != TapeState::Retired {
            self.state = TapeState::Full;
        }
    }

    pub fn mark_conflict(&mut self) {
        if self.state != TapeState::Retired {
            self.state = TapeState::Conflict;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_then_unload_sequence() {
        let mut tape = TapeCatalog::new("TAPE01L6", 4, 1000);
        tape.loaded_into_drive(0).unwrap();
        assert_eq!(tape.current_location, TapeLocation::Drive(0));
        assert_eq!(tape.home_slot(), Some(4));

        tape.unloaded_to_slot(0, 4).unwrap();
        assert_eq!(tape.current_location, TapeLocation::Slot(4));
        assert_eq!(tape.previous_location, Some(TapeLocation::Drive(0)));
    }

    #[test]
    fn test_cannot_load_twice() {
        let mut tape = TapeCatalog::new("TAPE01L6", 4, 1000);
        tape.loaded_into_drive(0).unwrap();
        assert!(tape.loaded_into_drive(1).is_err());
    }

    #[test]
    fn test_cannot_unload_from_other_drive() {
        let mut tape = TapeCatalog::new("TAPE01L6", 4, 1000);
        assert!(tape.unloaded_to_slot(0, 4).is_err());
        tape.loaded_into_drive(1).unwrap();
        assert!(tape.unloaded_to_slot(0, 4).is_err());
        assert_eq!(tape.current_location, TapeLocation::Drive(1));
    }

    #[test]
    fn test_record_file_written() {
        let mut tape = TapeCatalog::new("TAPE01L6", 1, 1000);
        tape.record_file_written(300).unwrap();
        assert_eq!(tape.state, TapeState::Open);
        assert_eq!(tape.file_count, 1);
        assert_eq!(tape.remaining_size, 700);
        assert!(tape.can_hold(700));
        assert!(!tape.can_hold(701));

        tape.mark_full();
        assert!(tape.record_file_written(1).is_err());
    }

    #[test]
    fn test_location_serialization() {
        let json = serde_json::to_value(TapeLocation::Drive(2)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "drive", "index": 2}));
        let state: TapeState = "CONFLICT".parse().unwrap();
        assert_eq!(state, TapeState::Conflict);
    }
}
