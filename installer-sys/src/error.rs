// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use installer_types::LayoutError;
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{0} was terminated by a signal")]
    CommandSignalled(String),

    #[error("{command} did not finish within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    #[error("Failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Timed out after {0:?} waiting for {1}")]
    LockTimeout(Duration, String),

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl SysError {
    pub fn parse(what: impl Into<String>, detail: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    /// Exit code of a failed command, if the failure came from one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
