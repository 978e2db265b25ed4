// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for the installer
//!
//! This crate wraps the external tools the installer drives (cryptsetup,
//! LVM, ZFS, mount, lsblk, pacstrap) behind small functions that take a
//! [`CommandRunner`]. It contains no policy: deciding what to run and in
//! which order is left to `installer-core`.

pub mod clock;
pub mod command;
pub mod cpuinfo;
pub mod devices;
pub mod error;
pub mod firmware;
pub mod luks;
pub mod lvm;
pub mod meminfo;
pub mod mount;
pub mod packages;
pub mod zfs;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock, poll_until, wait_for_pacman_lock};
pub use command::{Cmd, CommandOutput, CommandRunner, DryRunRunner, SystemRunner, require_tool};
pub use cpuinfo::CpuVendor;
pub use devices::{DeviceQuery, LsblkDevices, LsblkInfo};
pub use error::{Result, SysError};
pub use firmware::Firmware;
pub use luks::{KeySlotCost, Luks2, UnlockedLuks};
pub use packages::{PackageInstaller, Pacstrap};
