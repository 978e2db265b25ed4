// SPDX-License-Identifier: GPL-3.0-only

//! Checks run before anything is written to disk

use std::path::Path;

use installer_sys::Firmware;
use installer_types::{
    Bootloader, BootloaderConfiguration, DiskLayoutConfiguration, PartitionModification,
};
use tracing::warn;

use crate::error::{InstallError, Result};

/// Whatever partition ends up mounted at `/boot`
fn boot_mount(layout: &DiskLayoutConfiguration) -> Option<&PartitionModification> {
    layout
        .partitions()
        .find(|p| p.mountpoint.as_deref() == Some(Path::new("/boot")))
}

/// Reject bootloader selections the hardware or layout cannot support
///
/// Returns the configuration to install with; `removable` is switched off
/// where it has no meaning.
pub fn validate_bootloader(
    firmware: Firmware,
    layout: &DiskLayoutConfiguration,
    config: BootloaderConfiguration,
) -> Result<BootloaderConfiguration> {
    let bootloader = config.bootloader;

    if bootloader.requires_uefi() && !firmware.uefi {
        return Err(InstallError::HardwareIncompatibility(format!(
            "{bootloader} requires a UEFI system"
        )));
    }
    if layout.zfs_config.is_some() && !firmware.uefi {
        return Err(InstallError::HardwareIncompatibility(
            "ZFS root is only supported on UEFI systems".into(),
        ));
    }

    if let Some(esp) = layout.efi_partition()
        && !esp.fs_type.is_some_and(|fs| fs.is_fat())
    {
        return Err(InstallError::Configuration(format!(
            "the EFI system partition {} must be FAT12, FAT16 or FAT32",
            esp.describe()
        )));
    }

    if bootloader == Bootloader::Limine
        && let Some(boot) = boot_mount(layout)
        && !boot.fs_type.is_some_and(|fs| fs.is_fat())
    {
        return Err(InstallError::Configuration(
            "Limine requires /boot to be a FAT filesystem".into(),
        ));
    }

    if bootloader != Bootloader::NoBootloader && firmware.uefi && layout.efi_partition().is_none() {
        return Err(InstallError::Configuration(format!(
            "{bootloader} on UEFI needs an EFI system partition"
        )));
    }

    if config.uki && !bootloader.has_uki_support() {
        return Err(InstallError::Configuration(format!(
            "{bootloader} cannot boot unified kernel images"
        )));
    }
    if config.uki && !firmware.uefi {
        return Err(InstallError::HardwareIncompatibility(
            "unified kernel images need UEFI".into(),
        ));
    }

    let mut config = config;
    if config.removable {
        if !firmware.uefi {
            warn!("Removable install requested but system is not UEFI; disabling");
            config.removable = false;
        } else if !bootloader.has_removable_support() {
            warn!("{bootloader} lacks removable support; disabling");
            config.removable = false;
        }
    }
    Ok(config)
}
