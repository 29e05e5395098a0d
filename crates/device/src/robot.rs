//! Tape robot (media changer) control through `mtx`.

use crate::error::{DeviceError, DeviceResult};
use crate::process::{ProcessExecutor, run_checked};
use serde::Serialize;
use std::sync::Arc;
use tapevault_core::config::TapeRobotConf;
use tracing::instrument;

/// Moves cartridges between storage slots and drives.
pub trait TapeLoadUnloadService: Send + Sync {
    fn status(&self) -> DeviceResult<TapeLibrarySpec>;

    fn load_tape(&self, slot: u32, drive: u32) -> DeviceResult<()>;

    fn unload_tape(&self, slot: u32, drive: u32) -> DeviceResult<()>;
}

/// A drive as seen by the changer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriveSlot {
    pub index: u32,
    /// Cartridge in the drive, if any.
    pub tape: Option<SlotContent>,
}

/// A storage element as seen by the changer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageSlot {
    pub index: u32,
    pub import_export: bool,
    pub tape: Option<SlotContent>,
}

/// Cartridge occupying an element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotContent {
    /// Barcode, when the changer has a reader.
    pub volume_tag: Option<String>,
    pub alternate_volume_tag: Option<String>,
    /// For drives: the storage element the cartridge was loaded from.
    pub source_slot: Option<u32>,
}

/// Parsed `mtx status` report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TapeLibrarySpec {
    pub device: Option<String>,
    pub drive_count: u32,
    pub slot_count: u32,
    pub import_export_count: u32,
    pub drives: Vec<DriveSlot>,
    pub slots: Vec<StorageSlot>,
}

impl TapeLibrarySpec {
    pub fn drive(&self, index: u32) -> Option<&DriveSlot> {
        self.drives.iter().find(|d| d.index == index)
    }

    pub fn slot(&self, index: u32) -> Option<&StorageSlot> {
        self.slots.iter().find(|s| s.index == index)
    }

    /// Parse the output of `mtx -f <device> status`.
    pub fn parse(output: &str) -> DeviceResult<Self> {
        let mut spec = TapeLibrarySpec::default();
        let mut header_seen = false;

        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("Storage Changer ") {
                parse_header(rest, &mut spec)?;
                header_seen = true;
            } else if let Some(rest) = line.strip_prefix("Data Transfer Element ") {
                let (index, state) = split_element(rest)?;
                spec.drives.push(DriveSlot {
                    index,
                    tape: parse_content(state)?,
                });
            } else if let Some(rest) = line.strip_prefix("Storage Element ") {
                let (head, state) = rest.split_once(':').ok_or_else(|| parse_error(line))?;
                let import_export = head.contains("IMPORT/EXPORT");
                let index = parse_u32(head.split_whitespace().next().unwrap_or(""), line)?;
                spec.slots.push(StorageSlot {
                    index,
                    import_export,
                    tape: parse_content(state)?,
                });
            }
        }

        if !header_seen {
            return Err(DeviceError::Parse {
                what: "mtx status",
                reason: "missing Storage Changer header".to_string(),
            });
        }
        Ok(spec)
    }
}

// "/dev/sg3:2 Drives, 24 Slots ( 1 Import/Export )"
fn parse_header(rest: &str, spec: &mut TapeLibrarySpec) -> DeviceResult<()> {
    let (device, counts) = rest.rsplit_once(':').ok_or_else(|| parse_error(rest))?;
    spec.device = Some(device.trim().to_string());
    let tokens: Vec<&str> = counts
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .collect();
    for pair in tokens.windows(2) {
        let Ok(n) = pair[0].parse::<u32>() else {
            continue;
        };
        match pair[1] {
            "Drives" | "Drive" => spec.drive_count = n,
            "Slots" | "Slot" => spec.slot_count = n,
            "Import/Export" => spec.import_export_count = n,
            _ => {}
        }
    }
    Ok(())
}

// "0:Full (Storage Element 1 Loaded):VolumeTag = TAPE01L5"
fn split_element(rest: &str) -> DeviceResult<(u32, &str)> {
    let (index, state) = rest.split_once(':').ok_or_else(|| parse_error(rest))?;
    Ok((parse_u32(index.trim(), rest)?, state))
}

fn parse_content(state: &str) -> DeviceResult<Option<SlotContent>> {
    let state = state.trim();
    if state.starts_with("Empty") {
        return Ok(None);
    }
    if !state.starts_with("Full") {
        return Err(parse_error(state));
    }

    let mut content = SlotContent {
        volume_tag: None,
        alternate_volume_tag: None,
        source_slot: None,
    };
    if let Some(start) = state.find("(Storage Element ") {
        let rest = &state[start + "(Storage Element ".len()..];
        let number = rest.split_whitespace().next().unwrap_or("");
        content.source_slot = number.parse().ok();
    }
    for field in state.split(':').skip(1) {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "VolumeTag" => content.volume_tag = Some(value.to_string()),
            "AlternateVolumeTag" => content.alternate_volume_tag = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(Some(content))
}

fn parse_u32(value: &str, line: &str) -> DeviceResult<u32> {
    value.parse().map_err(|_| parse_error(line))
}

fn parse_error(line: &str) -> DeviceError {
    DeviceError::Parse {
        what: "mtx status",
        reason: format!("unexpected line {line:?}"),
    }
}

/// Robot controlled by invoking `mtx`.
pub struct MtxTapeLibraryService {
    conf: TapeRobotConf,
    executor: Arc<dyn ProcessExecutor>,
}

impl MtxTapeLibraryService {
    pub fn new(conf: TapeRobotConf, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { conf, executor }
    }

    fn args(&self, op: &str, extra: &[u32]) -> Vec<String> {
        let mut args = vec!["-f".to_string(), self.conf.device.clone(), op.to_string()];
        args.extend(extra.iter().map(u32::to_string));
        args
    }
}

impl TapeLoadUnloadService for MtxTapeLibraryService {
    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn status(&self) -> DeviceResult<TapeLibrarySpec> {
        let output = run_checked(
            self.executor.as_ref(),
            &self.conf.mtx_path,
            self.conf.timeout(),
            self.args("status", &[]),
            || "Could not retrieve tape library status".to_string(),
        )?;
        TapeLibrarySpec::parse(&output.stdout)
    }

    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn load_tape(&self, slot: u32, drive: u32) -> DeviceResult<()> {
        run_checked(
            self.executor.as_ref(),
            &self.conf.mtx_path,
            self.conf.timeout(),
            self.args("load", &[slot, drive]),
            || format!("Could not load tape from slot {slot} into drive {drive}"),
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn unload_tape(&self, slot: u32, drive: u32) -> DeviceResult<()> {
        run_checked(
            self.executor.as_ref(),
            &self.conf.mtx_path,
            self.conf.timeout(),
            self.args("unload", &[slot, drive]),
            || format!("Could not unload tape from drive {drive} into slot {slot}"),
        )?;
        Ok(())
    }
}
