// SPDX-License-Identifier: GPL-3.0-only

use installer_sys::SysError;
use installer_types::LayoutError;
use thiserror::Error;

/// Broad classes callers use to decide how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Hardware,
    Disk,
    Service,
    Requirement,
}

/// Error types for installation steps
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Hardware incompatibility: {0}")]
    HardwareIncompatibility(String),

    #[error("Disk error: {0}")]
    Disk(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Requirement not met: {0}")]
    Requirement(String),

    #[error(transparent)]
    Sys(#[from] SysError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Layout(_) => ErrorKind::Configuration,
            Self::HardwareIncompatibility(_) => ErrorKind::Hardware,
            Self::Disk(_) | Self::Sys(_) | Self::Io(_) => ErrorKind::Disk,
            Self::Service(_) => ErrorKind::Service,
            Self::Requirement(_) => ErrorKind::Requirement,
        }
    }

    /// Wrap a tool failure as a disk error with context
    pub fn disk(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::Disk(format!("{context}: {err}"))
    }
}

/// Result type alias for installation steps
pub type Result<T> = std::result::Result<T, InstallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_and_io_failures_count_as_disk_errors() {
        let sys = InstallError::from(SysError::ToolMissing("cryptsetup".into()));
        assert_eq!(sys.kind(), ErrorKind::Disk);

        let io = InstallError::from(std::io::Error::other("read-only filesystem"));
        assert_eq!(io.kind(), ErrorKind::Disk);

        let layout = InstallError::from(LayoutError::MissingPassword("LUKS"));
        assert_eq!(layout.kind(), ErrorKind::Configuration);
    }
}
