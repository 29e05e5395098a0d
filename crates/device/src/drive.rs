//! Tape drive positioning and status through `mt`.

use crate::error::{DeviceError, DeviceResult};
use crate::process::{ProcessExecutor, run_checked};
use serde::Serialize;
use std::sync::Arc;
use tapevault_core::config::TapeDriveConf;
use tracing::instrument;

/// Positioning and status of one drive.
///
/// Calls block for at most the configured timeout and are never retried.
/// Callers must not issue two commands to the same drive concurrently.
pub trait TapeDriveCommandService: Send + Sync {
    fn status(&self) -> DeviceResult<TapeDriveStatus>;

    fn rewind(&self) -> DeviceResult<()>;

    /// Seek to end of recorded data.
    fn go_to_end(&self) -> DeviceResult<()>;

    /// Move `count` files forward, or backward to the start of the file
    /// `count` files before the current one.
    fn move_position(&self, count: u32, backward: bool) -> DeviceResult<()>;
}

/// Parsed `mt status` report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TapeDriveStatus {
    pub description: Option<String>,
    /// Current file (file mark count from beginning of tape); `None` when unknown.
    pub file_number: Option<u32>,
    pub block_number: Option<u64>,
    pub partition: Option<u32>,
    pub block_size: Option<u64>,
    pub density: Option<String>,
    pub soft_error_count: Option<u64>,
    /// General status bits, e.g. `BOT`, `ONLINE`, `DR_OPEN`, `WR_PROT`.
    pub status_bits: Vec<String>,
}

impl TapeDriveStatus {
    fn has_bit(&self, bit: &str) -> bool {
        self.status_bits.iter().any(|b| b == bit)
    }

    /// A cartridge is loaded and ready.
    pub fn has_tape(&self) -> bool {
        self.has_bit("ONLINE") && !self.has_bit("DR_OPEN")
    }

    pub fn is_write_protected(&self) -> bool {
        self.has_bit("WR_PROT")
    }

    pub fn at_beginning(&self) -> bool {
        self.has_bit("BOT")
    }

    pub fn at_end_of_data(&self) -> bool {
        self.has_bit("EOD")
    }

    /// Parse the output of `mt -f <device> status` (mt-st format).
    pub fn parse(output: &str) -> DeviceResult<Self> {
        let mut status = TapeDriveStatus::default();
        let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
        let mut recognized = false;

        while let Some(line) = lines.next() {
            if line.ends_with("tape drive:") {
                status.description = Some(line.trim_end_matches(':').to_string());
                recognized = true;
            } else if line.starts_with("File number=") {
                for part in line.trim_end_matches('.').split(',') {
                    let Some((key, value)) = part.trim().split_once('=') else {
                        continue;
                    };
                    // mt reports -1 when the position is lost.
                    let value = value.trim().parse::<i64>().ok().filter(|v| *v >= 0);
                    match key.trim() {
                        "File number" => status.file_number = value.map(|v| v as u32),
                        "block number" => status.block_number = value.map(|v| v as u64),
                        "partition" => status.partition = value.map(|v| v as u32),
                        _ => {}
                    }
                }
                recognized = true;
            } else if let Some(rest) = line.strip_prefix("Tape block size ") {
                let (size, density) = rest.split_once("bytes.").unwrap_or((rest, ""));
                status.block_size = size.trim().parse().ok();
                if let Some(density) = density.trim().strip_prefix("Density code ") {
                    status.density = Some(density.trim_end_matches('.').to_string());
                }
            } else if let Some(rest) = line.strip_prefix("Soft error count since last status=") {
                status.soft_error_count = rest.trim().parse().ok();
            } else if line.starts_with("General status bits on") {
                if let Some(bits) = lines.next() {
                    status.status_bits = bits.split_whitespace().map(str::to_string).collect();
                }
                recognized = true;
            }
        }

        if !recognized {
            return Err(DeviceError::Parse {
                what: "mt status",
                reason: format!("unrecognized output: {:?}", output.trim()),
            });
        }
        Ok(status)
    }
}

/// Count handed to `bsfm` to land at the start of the file `count` files back.
///
/// `bsfm n` crosses `n` file marks towards the beginning of tape and then
/// steps forward over the last one, so it stops at the start of the file
/// following that mark. From the start of the current file, the first mark
/// crossed is the one just before it: reaching the start of the file `count`
/// files back needs one mark more than `count`.
pub fn backward_file_mark_count(count: u32) -> DeviceResult<u32> {
    count.checked_add(1).ok_or_else(|| {
        DeviceError::InvalidOperation(format!("cannot move back {count} files"))
    })
}

/// Drive controlled by invoking `mt`.
pub struct MtTapeDriveService {
    conf: TapeDriveConf,
    executor: Arc<dyn ProcessExecutor>,
}

impl MtTapeDriveService {
    pub fn new(conf: TapeDriveConf, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { conf, executor }
    }

    fn mt(
        &self,
        op: &str,
        extra: Option<u32>,
        failure: impl FnOnce() -> String,
    ) -> DeviceResult<String> {
        let mut args = vec!["-f".to_string(), self.conf.device.clone(), op.to_string()];
        if let Some(n) = extra {
            args.push(n.to_string());
        }
        let output = run_checked(
            self.executor.as_ref(),
            &self.conf.mt_path,
            self.conf.timeout(),
            args,
            failure,
        )?;
        Ok(output.stdout)
    }
}

impl TapeDriveCommandService for MtTapeDriveService {
    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn status(&self) -> DeviceResult<TapeDriveStatus> {
        let stdout = self.mt("status", None, || {
            format!("Could not retrieve status of drive {}", self.conf.index)
        })?;
        TapeDriveStatus::parse(&stdout)
    }

    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn rewind(&self) -> DeviceResult<()> {
        self.mt("rewind", None, || {
            format!("Could not rewind tape in drive {}", self.conf.index)
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn go_to_end(&self) -> DeviceResult<()> {
        self.mt("eod", None, || {
            format!("Could not go to end of data in drive {}", self.conf.index)
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn move_position(&self, count: u32, backward: bool) -> DeviceResult<()> {
        let failure = || {
            format!(
                "Could not move {} {count} file(s) in drive {}",
                if backward { "backward" } else { "forward" },
                self.conf.index
            )
        };
        if backward {
            self.mt("bsfm", Some(backward_file_mark_count(count)?), failure)?;
        } else {
            self.mt("fsf", Some(count), failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOADED: &str = "SCSI 2 tape drive:
File number=3, block number=0, partition=0.
Tape block size 0 bytes. Density code 0x58 (LTO-5).
Soft error count since last status=0
General status bits on (81010000):
 EOF ONLINE IM_REP_EN
";

    const EMPTY: &str = "SCSI 2 tape drive:
File number=-1, block number=-1, partition=0.
Tape block size 0 bytes. Density code 0x0 (default).
Soft error count since last status=0
General status bits on (50000):
 DR_OPEN IM_REP_EN
";

    #[test]
    fn test_parse_loaded_drive() {
        let status = TapeDriveStatus::parse(LOADED).unwrap();
        assert_eq!(status.description.as_deref(), Some("SCSI 2 tape drive"));
        assert_eq!(status.file_number, Some(3));
        assert_eq!(status.block_number, Some(0));
        assert_eq!(status.partition, Some(0));
        assert_eq!(status.block_size, Some(0));
        assert_eq!(status.density.as_deref(), Some("0x58 (LTO-5)"));
        assert_eq!(status.soft_error_count, Some(0));
        assert_eq!(status.status_bits, ["EOF", "ONLINE", "IM_REP_EN"]);
        assert!(status.has_tape());
        assert!(!status.at_beginning());
    }

    #[test]
    fn test_parse_empty_drive() {
        let status = TapeDriveStatus::parse(EMPTY).unwrap();
        assert_eq!(status.file_number, None);
        assert!(!status.has_tape());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(TapeDriveStatus::parse("mt: command not understood").is_err());
    }

    #[test]
    fn test_backward_count_adds_one_mark() {
        assert_eq!(backward_file_mark_count(0).unwrap(), 1);
        assert_eq!(backward_file_mark_count(5).unwrap(), 6);
        assert!(matches!(
            backward_file_mark_count(u32::MAX),
            Err(DeviceError::InvalidOperation(_))
        ));
    }
}
