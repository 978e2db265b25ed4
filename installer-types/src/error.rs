// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors raised while building or validating a plan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("sector size must be a non-zero multiple of 512 bytes, got {0}")]
    InvalidSectorSize(u64),

    #[error("{0} encryption requires at least one element to encrypt")]
    NothingToEncrypt(&'static str),

    #[error("an encryption password is required for {0}")]
    MissingPassword(&'static str),

    #[error("partition has no device path yet: {0}")]
    MissingDevicePath(String),

    #[error("no filesystem type set for {0}")]
    MissingFilesystem(String),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("mountpoint must be absolute: {0:?}")]
    RelativeMountpoint(PathBuf),

    #[error("{} has {count} {role} partitions, at most one is allowed", device.display())]
    DuplicateRole {
        device: PathBuf,
        role: &'static str,
        count: usize,
    },

    #[error("the EFI system partition cannot be encrypted: {0}")]
    EncryptedEsp(String),

    #[error("invalid plan: {0}")]
    Invalid(String),
}

/// Result type alias for plan construction
pub type Result<T> = std::result::Result<T, LayoutError>;
