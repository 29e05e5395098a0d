//! Tape library device control for tapevault.
//!
//! This crate drives the physical side of the tape tier:
//! - [`robot`]: loading and unloading cartridges with `mtx`
//! - [`drive`]: positioning and status with `mt`
//! - [`read_write`]: copying TAR files to and from tape with `dd`
//! - [`simulator`]: an in-memory library implementing the same traits
//!
//! Every external command runs through a [`ProcessExecutor`] with a
//! configured timeout. Commands are never retried here: a failure surfaces
//! as [`DeviceError::Command`] carrying the exit code and captured output.

pub mod drive;
pub mod error;
pub mod process;
pub mod read_write;
pub mod robot;
pub mod simulator;

pub use drive::{MtTapeDriveService, TapeDriveCommandService, TapeDriveStatus};
pub use error::{DeviceError, DeviceResult};
pub use process::{CommandOutput, ProcessExecutor, SystemProcessExecutor};
pub use read_write::{DdTapeReadWriteService, TapeReadWriteService};
pub use robot::{MtxTapeLibraryService, TapeLibrarySpec, TapeLoadUnloadService};
pub use simulator::{SimulatedDrive, SimulatedOp, SimulatedRobot, SimulatedTapeLibrary};

use std::sync::Arc;
use tapevault_core::config::{TapeDriveConf, TapeRobotConf};

/// One drive's command and data services.
pub struct DriveHandle {
    pub index: u32,
    pub commands: Arc<dyn TapeDriveCommandService>,
    pub read_write: Arc<dyn TapeReadWriteService>,
}

/// Build the `mtx` robot service for `conf`.
pub fn robot_from_config(
    conf: &TapeRobotConf,
    executor: Arc<dyn ProcessExecutor>,
) -> Arc<dyn TapeLoadUnloadService> {
    Arc::new(MtxTapeLibraryService::new(conf.clone(), executor))
}

/// Build the `mt` and `dd` services for one drive.
pub fn drive_from_config(conf: &TapeDriveConf, executor: Arc<dyn ProcessExecutor>) -> DriveHandle {
    DriveHandle {
        index: conf.index,
        commands: Arc::new(MtTapeDriveService::new(conf.clone(), executor.clone())),
        read_write: Arc::new(DdTapeReadWriteService::new(conf.clone(), executor)),
    }
}

impl SimulatedTapeLibrary {
    /// Drive handle backed by this simulated library.
    pub fn drive_handle(&self, index: u32) -> DriveHandle {
        DriveHandle {
            index,
            commands: Arc::new(self.drive(index)),
            read_write: Arc::new(self.drive(index)),
        }
    }
}
