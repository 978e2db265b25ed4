// SPDX-License-Identifier: GPL-3.0-only

//! Canonical plan models for the installer
//!
//! This crate defines the values the layout planner produces and every later
//! stage consumes:
//!
//! - **installer-core planner**: builds `DeviceModification`s, LVM and ZFS configurations
//! - **installer-core orchestrator**: borrows the plan read-only to unlock and mount
//! - **installer-cli**: reads and writes the plan as TOML or JSON
//!
//! ## Architecture
//!
//! - `Size` → sector-size-aware integer arithmetic
//! - `DeviceModification` → `PartitionModification` → `SubvolumeModification`
//! - `LvmConfiguration` → `LvmVolumeGroup` → `LvmVolume`
//! - `ZfsConfiguration` → `ZfsPool` → `ZfsDatasetConfig`
//! - `DiskEncryption` → which partitions or volumes are wrapped in LUKS
//! - `DiskLayoutConfiguration` → everything above, plus the root lookup
//!
//! Plan elements reference each other by object id instead of holding copies,
//! so the runtime handle map built during mounting never aliases the plan.

pub mod bootloader;
pub mod device;
pub mod encryption;
pub mod error;
pub mod layout;
pub mod lvm;
pub mod plan;
pub mod size;
pub mod zfs;

pub use bootloader::{Bootloader, BootloaderConfiguration};
pub use device::{
    BlockDevice, DeviceModification, FilesystemType, ModificationStatus, PartitionFlag,
    PartitionInfo, PartitionModification, PartitionTable, PartitionType, SubvolumeModification,
};
pub use encryption::{DEFAULT_ITER_TIME, DiskEncryption, EncryptionType, LuksPbkdf, Password};
pub use error::{LayoutError, Result};
pub use layout::{DiskLayoutConfiguration, DiskLayoutType, RootElement};
pub use lvm::{LvmConfiguration, LvmLayoutType, LvmVolume, LvmVolumeGroup, LvmVolumeStatus};
pub use plan::{ConsoleConfig, InstallPlan, ZramAlgorithm, ZramConfig};
pub use size::{GPT_ALIGNMENT_BYTES, SectorSize, Size, Unit};
pub use zfs::{ZfsConfiguration, ZfsDatasetConfig, ZfsLayoutType, ZfsPool, default_zfs_datasets};
