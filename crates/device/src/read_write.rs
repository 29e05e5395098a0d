//! Copying whole TAR files to and from tape through `dd`.

use crate::error::DeviceResult;
use crate::process::{ProcessExecutor, run_checked};
use std::path::Path;
use std::sync::Arc;
use tapevault_core::config::TapeDriveConf;
use tracing::instrument;

/// Sequential file transfer on the current drive position.
///
/// A write lands at the current position and is followed by a file mark.
/// A read consumes one tape file and leaves the head after its file mark.
pub trait TapeReadWriteService: Send + Sync {
    fn write_to_tape(&self, input: &Path) -> DeviceResult<()>;

    fn read_from_tape(&self, output: &Path) -> DeviceResult<()>;
}

pub struct DdTapeReadWriteService {
    conf: TapeDriveConf,
    executor: Arc<dyn ProcessExecutor>,
}

impl DdTapeReadWriteService {
    pub fn new(conf: TapeDriveConf, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { conf, executor }
    }

    fn dd(&self, input: &str, output: &str, failure: impl FnOnce() -> String) -> DeviceResult<()> {
        let args = vec![
            format!("if={input}"),
            format!("of={output}"),
            format!("bs={}", self.conf.block_size),
        ];
        run_checked(
            self.executor.as_ref(),
            &self.conf.dd_path,
            self.conf.read_write_timeout(),
            args,
            failure,
        )?;
        Ok(())
    }
}

impl TapeReadWriteService for DdTapeReadWriteService {
    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn write_to_tape(&self, input: &Path) -> DeviceResult<()> {
        let input = input.display().to_string();
        self.dd(&input, &self.conf.device, || {
            format!("Could not write file {input} to drive {}", self.conf.index)
        })
    }

    #[instrument(skip(self), fields(device = %self.conf.device))]
    fn read_from_tape(&self, output: &Path) -> DeviceResult<()> {
        let output = output.display().to_string();
        self.dd(&self.conf.device, &output, || {
            format!("Could not read file from drive {} into {output}", self.conf.index)
        })
    }
}
