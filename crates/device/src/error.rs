//! Device control error types.

use crate::process::CommandOutput;
use thiserror::Error;

/// Device control errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Non-zero exit or timeout of an external tool. Carries everything it printed.
    #[error("{message} ({output})")]
    Command {
        message: String,
        output: CommandOutput,
    },

    #[error("could not parse {what} output: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid device operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Captured output of the failed command, if any.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Command { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Result type for device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
