//! In-memory tape library for tests and dry runs.
//!
//! Behaves like a robot with sequential drives: loading puts the head at
//! beginning of tape, writing truncates everything after the head, and each
//! tape file is kept as one byte buffer.

use crate::drive::{TapeDriveCommandService, TapeDriveStatus};
use crate::error::{DeviceError, DeviceResult};
use crate::process::CommandOutput;
use crate::read_write::TapeReadWriteService;
use crate::robot::{DriveSlot, SlotContent, StorageSlot, TapeLibrarySpec, TapeLoadUnloadService};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Operation that can be made to fail once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    LibraryStatus,
    Load,
    Unload,
    DriveStatus,
    Rewind,
    GoToEnd,
    Move,
    Write,
    Read,
}

#[derive(Debug)]
struct LoadedTape {
    code: String,
    source_slot: u32,
    position: usize,
}

#[derive(Debug, Default)]
struct LibraryState {
    slots: BTreeMap<u32, Option<String>>,
    drives: BTreeMap<u32, Option<LoadedTape>>,
    files: HashMap<String, Vec<Vec<u8>>>,
    failures: HashMap<SimulatedOp, u32>,
}

/// Shared handle on a simulated library. Clones see the same state.
#[derive(Clone, Debug, Default)]
pub struct SimulatedTapeLibrary {
    state: Arc<Mutex<LibraryState>>,
}

impl SimulatedTapeLibrary {
    /// Library with slots `1..=slot_count` and drives `0..drive_count`.
    pub fn new(slot_count: u32, drive_count: u32) -> Self {
        let state = LibraryState {
            slots: (1..=slot_count).map(|s| (s, None)).collect(),
            drives: (0..drive_count).map(|d| (d, None)).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Place a blank cartridge in `slot`.
    pub fn insert_tape(&self, slot: u32, code: impl Into<String>) -> &Self {
        let code = code.into();
        let mut state = self.lock();
        state.files.entry(code.clone()).or_default();
        state.slots.insert(slot, Some(code));
        self
    }

    /// Make the next `op` fail with a non-zero exit.
    pub fn fail_next(&self, op: SimulatedOp) {
        *self.lock().failures.entry(op).or_default() += 1;
    }

    /// Files recorded on a cartridge, in tape order.
    pub fn tape_files(&self, code: &str) -> Option<Vec<Vec<u8>>> {
        self.lock().files.get(code).cloned()
    }

    /// Code of the cartridge in `drive`, if any.
    pub fn tape_in_drive(&self, drive: u32) -> Option<String> {
        self.lock()
            .drives
            .get(&drive)
            .and_then(|d| d.as_ref().map(|t| t.code.clone()))
    }

    pub fn robot(&self) -> SimulatedRobot {
        SimulatedRobot {
            library: self.clone(),
        }
    }

    pub fn drive(&self, index: u32) -> SimulatedDrive {
        SimulatedDrive {
            library: self.clone(),
            index,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LibraryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LibraryState {
    fn check_failure(&mut self, op: SimulatedOp) -> DeviceResult<()> {
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(command_error(format!("{op:?} failed"), "injected failure"));
            }
        }
        Ok(())
    }

    fn loaded(&mut self, drive: u32) -> DeviceResult<&mut LoadedTape> {
        self.drives
            .get_mut(&drive)
            .ok_or_else(|| command_error(format!("drive {drive}"), "no such drive"))?
            .as_mut()
            .ok_or_else(|| command_error(format!("drive {drive}"), "no tape loaded"))
    }
}

fn command_error(message: String, stderr: &str) -> DeviceError {
    DeviceError::Command {
        message,
        output: CommandOutput {
            exit_code: Some(1),
            stderr: stderr.to_string(),
            ..Default::default()
        },
    }
}

/// Robot view of a [`SimulatedTapeLibrary`].
pub struct SimulatedRobot {
    library: SimulatedTapeLibrary,
}

impl TapeLoadUnloadService for SimulatedRobot {
    fn status(&self) -> DeviceResult<TapeLibrarySpec> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::LibraryStatus)?;
        let tag = |code: &str| SlotContent {
            volume_tag: Some(code.to_string()),
            alternate_volume_tag: None,
            source_slot: None,
        };
        Ok(TapeLibrarySpec {
            device: Some("simulated".to_string()),
            drive_count: state.drives.len() as u32,
            slot_count: state.slots.len() as u32,
            import_export_count: 0,
            drives: state
                .drives
                .iter()
                .map(|(index, loaded)| DriveSlot {
                    index: *index,
                    tape: loaded.as_ref().map(|t| SlotContent {
                        source_slot: Some(t.source_slot),
                        ..tag(&t.code)
                    }),
                })
                .collect(),
            slots: state
                .slots
                .iter()
                .map(|(index, code)| StorageSlot {
                    index: *index,
                    import_export: false,
                    tape: code.as_deref().map(tag),
                })
                .collect(),
        })
    }

    fn load_tape(&self, slot: u32, drive: u32) -> DeviceResult<()> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::Load)?;
        let message = || format!("Could not load tape from slot {slot} into drive {drive}");
        match state.drives.get(&drive) {
            None => return Err(command_error(message(), "no such drive")),
            Some(Some(_)) => return Err(command_error(message(), "drive is full")),
            Some(None) => {}
        }
        let code = state
            .slots
            .get_mut(&slot)
            .and_then(Option::take)
            .ok_or_else(|| command_error(message(), "source slot is empty"))?;
        state.drives.insert(
            drive,
            Some(LoadedTape {
                code,
                source_slot: slot,
                position: 0,
            }),
        );
        Ok(())
    }

    fn unload_tape(&self, slot: u32, drive: u32) -> DeviceResult<()> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::Unload)?;
        let message = || format!("Could not unload tape from drive {drive} into slot {slot}");
        match state.slots.get(&slot) {
            None => return Err(command_error(message(), "no such slot")),
            Some(Some(_)) => return Err(command_error(message(), "destination slot is full")),
            Some(None) => {}
        }
        let loaded = state
            .drives
            .get_mut(&drive)
            .and_then(Option::take)
            .ok_or_else(|| command_error(message(), "drive is empty"))?;
        state.slots.insert(slot, Some(loaded.code));
        Ok(())
    }
}

/// Drive view of a [`SimulatedTapeLibrary`].
pub struct SimulatedDrive {
    library: SimulatedTapeLibrary,
    index: u32,
}

impl TapeDriveCommandService for SimulatedDrive {
    fn status(&self) -> DeviceResult<TapeDriveStatus> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::DriveStatus)?;
        let loaded = state
            .drives
            .get(&self.index)
            .ok_or_else(|| command_error(format!("drive {}", self.index), "no such drive"))?;
        let Some(tape) = loaded else {
            return Ok(TapeDriveStatus {
                description: Some("simulated tape drive".to_string()),
                status_bits: vec!["DR_OPEN".to_string()],
                ..Default::default()
            });
        };
        let file_count = state.files.get(&tape.code).map_or(0, Vec::len);
        let mut bits = vec!["ONLINE".to_string()];
        if tape.position == 0 {
            bits.push("BOT".to_string());
        }
        if tape.position == file_count {
            bits.push("EOD".to_string());
        }
        Ok(TapeDriveStatus {
            description: Some("simulated tape drive".to_string()),
            file_number: Some(tape.position as u32),
            block_number: Some(0),
            partition: Some(0),
            status_bits: bits,
            ..Default::default()
        })
    }

    fn rewind(&self) -> DeviceResult<()> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::Rewind)?;
        state.loaded(self.index)?.position = 0;
        Ok(())
    }

    fn go_to_end(&self) -> DeviceResult<()> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::GoToEnd)?;
        let code = state.loaded(self.index)?.code.clone();
        let end = state.files.get(&code).map_or(0, Vec::len);
        state.loaded(self.index)?.position = end;
        Ok(())
    }

    fn move_position(&self, count: u32, backward: bool) -> DeviceResult<()> {
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::Move)?;
        let code = state.loaded(self.index)?.code.clone();
        let end = state.files.get(&code).map_or(0, Vec::len);
        let tape = state.loaded(self.index)?;
        let count = count as usize;
        let target = if backward {
            tape.position.checked_sub(count)
        } else {
            tape.position.checked_add(count).filter(|t| *t <= end)
        };
        tape.position = target.ok_or_else(|| {
            command_error(
                format!("Could not move {count} file(s) in drive {}", self.index),
                "beginning or end of medium reached",
            )
        })?;
        Ok(())
    }
}

impl TapeReadWriteService for SimulatedDrive {
    fn write_to_tape(&self, input: &Path) -> DeviceResult<()> {
        let data = std::fs::read(input)?;
        let mut state = self.library.lock();
        state.check_failure(SimulatedOp::Write)?;
        let tape = state.loaded(self.index)?;
        let (code, position) = (tape.code.clone(), tape.position);
        tape.position += 1;
        let files = state.files.entry(code).or_default();
        files.truncate(position);
        files.push(data);
        Ok(())
    }

    fn read_from_tape(&self, output: &Path) -> DeviceResult<()> {
        let data = {
            let mut state = self.library.lock();
            state.check_failure(SimulatedOp::Read)?;
            let tape = state.loaded(self.index)?;
            let (code, position) = (tape.code.clone(), tape.position);
            let data = state
                .files
                .get(&code)
                .and_then(|files| files.get(position))
                .cloned()
                .ok_or_else(|| {
                    command_error(
                        format!("Could not read file from drive {}", self.index),
                        "end of data",
                    )
                })?;
            state.loaded(self.index)?.position += 1;
            data
        };
        std::fs::write(output, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_load_write_read_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let library = SimulatedTapeLibrary::new(3, 1);
        library.insert_tape(2, "TAPE02");
        let robot = library.robot();
        let drive = library.drive(0);

        robot.load_tape(2, 0).unwrap();
        assert_eq!(library.tape_in_drive(0).as_deref(), Some("TAPE02"));
        assert!(drive.status().unwrap().at_beginning());

        drive.write_to_tape(&write_file(dir.path(), "a", b"first")).unwrap();
        drive.write_to_tape(&write_file(dir.path(), "b", b"second")).unwrap();
        assert_eq!(drive.status().unwrap().file_number, Some(2));

        drive.move_position(1, true).unwrap();
        let out = dir.path().join("out");
        drive.read_from_tape(&out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"second");
        assert!(drive.read_from_tape(&out).is_err());

        drive.rewind().unwrap();
        drive.read_from_tape(&out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"first");

        robot.unload_tape(2, 0).unwrap();
        assert!(library.tape_in_drive(0).is_none());
        assert_eq!(library.tape_files("TAPE02").unwrap().len(), 2);
    }

    #[test]
    fn test_write_truncates_after_head() {
        let dir = tempfile::tempdir().unwrap();
        let library = SimulatedTapeLibrary::new(1, 1);
        library.insert_tape(1, "T");
        library.robot().load_tape(1, 0).unwrap();
        let drive = library.drive(0);
        for name in ["a", "b", "c"] {
            drive.write_to_tape(&write_file(dir.path(), name, name.as_bytes())).unwrap();
        }
        drive.rewind().unwrap();
        drive.move_position(1, false).unwrap();
        drive.write_to_tape(&write_file(dir.path(), "x", b"x")).unwrap();
        assert_eq!(
            library.tape_files("T").unwrap(),
            vec![b"a".to_vec(), b"x".to_vec()]
        );
    }

    #[test]
    fn test_robot_rejects_invalid_moves() {
        let library = SimulatedTapeLibrary::new(2, 1);
        library.insert_tape(1, "T1").insert_tape(2, "T2");
        let robot = library.robot();
        assert!(robot.load_tape(1, 5).is_err());
        robot.load_tape(1, 0).unwrap();
        assert!(robot.load_tape(2, 0).is_err());
        assert!(robot.unload_tape(2, 0).is_err());
        let status = robot.status().unwrap();
        assert_eq!(status.drive(0).unwrap().tape.as_ref().unwrap().source_slot, Some(1));
        assert!(status.slot(1).unwrap().tape.is_none());
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let library = SimulatedTapeLibrary::new(1, 1);
        library.insert_tape(1, "T");
        library.fail_next(SimulatedOp::Load);
        let err = library.robot().load_tape(1, 0).unwrap_err();
        assert_eq!(err.output().unwrap().stderr, "injected failure");
        library.robot().load_tape(1, 0).unwrap();
    }
}
