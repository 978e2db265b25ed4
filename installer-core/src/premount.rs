// SPDX-License-Identifier: GPL-3.0-only

//! Layouts the user partitioned and mounted by hand
//!
//! Nothing is created or mounted; the layout is read back from whatever is
//! mounted under the target so the later steps can find root, boot and ESP.

use std::path::{Path, PathBuf};

use installer_sys::{Cmd, Firmware};
use installer_types::{
    DeviceModification, DiskLayoutConfiguration, FilesystemType, ModificationStatus,
    PartitionFlag, PartitionInfo, PartitionModification, PartitionTable, SubvolumeModification,
};
use tracing::{debug, info, warn};

use crate::error::{InstallError, Result};
use crate::host::Host;

const ESP_MOUNTPOINTS: [&str; 2] = ["/efi", "/boot/efi"];

/// `mounted` as seen from inside `target`, if it is under it
fn in_target_path(target: &Path, mounted: &Path) -> Option<PathBuf> {
    let rest = mounted.strip_prefix(target).ok()?;
    Some(Path::new("/").join(rest))
}

fn flag_for(mountpoint: &Path, fs: Option<FilesystemType>, firmware: Firmware) -> Option<PartitionFlag> {
    let fat = fs.is_some_and(|fs| fs.is_fat());
    if ESP_MOUNTPOINTS.iter().any(|m| mountpoint == Path::new(m)) && fat {
        return Some(PartitionFlag::Esp);
    }
    if mountpoint == Path::new("/boot") {
        return Some(if fat && firmware.uefi {
            PartitionFlag::Esp
        } else {
            PartitionFlag::Boot
        });
    }
    None
}

/// Subvolume path of a btrfs mount, `/@home` → `@home`
fn btrfs_subvolume(host: &Host<'_>, mounted: &Path) -> Option<PathBuf> {
    let fsroot = host
        .runner
        .output(&Cmd::new("findmnt").args(["-n", "-o", "FSROOT"]).path_arg(mounted))
        .ok()?;
    let name = fsroot.trim_start_matches('/');
    (!name.is_empty()).then(|| PathBuf::from(name))
}

fn existing_partition(
    host: &Host<'_>,
    target: &Path,
    info: &PartitionInfo,
) -> Option<PartitionModification> {
    let mut mounts: Vec<(PathBuf, PathBuf)> = info
        .mountpoints
        .iter()
        .filter_map(|m| in_target_path(target, m).map(|inner| (m.clone(), inner)))
        .collect();
    if mounts.is_empty() {
        return None;
    }
    mounts.sort_by(|a, b| a.1.cmp(&b.1));

    let mut part = PartitionModification::create(info.start, info.length, info.fs_type);
    part.status = ModificationStatus::Exist;
    part.dev_path = Some(info.path.clone());
    part.partn = info.partn;
    part.partuuid = info.partuuid.clone();
    part.uuid = info.uuid.clone();

    if info.fs_type == Some(FilesystemType::Btrfs) {
        let subvols: Vec<SubvolumeModification> = mounts
            .iter()
            .filter_map(|(mounted, inner)| {
                btrfs_subvolume(host, mounted).map(|name| SubvolumeModification {
                    name,
                    mountpoint: Some(inner.clone()),
                })
            })
            .collect();
        if !subvols.is_empty() {
            part.btrfs_subvols = subvols;
            return Some(part);
        }
    }

    if mounts.len() > 1 {
        warn!("{} is mounted more than once under {}", info.path.display(), target.display());
    }
    let (_, mountpoint) = mounts.swap_remove(0);
    part.mountpoint = Some(mountpoint);
    Some(part)
}

/// Build a `PreMount` layout from what is currently mounted under `target`
pub fn detect_premounted_layout(host: &Host<'_>, target: &Path) -> Result<DiskLayoutConfiguration> {
    let mut device_modifications = Vec::new();

    for device in host.devices.block_devices()? {
        let mut modification = DeviceModification::new(device.clone(), false, PartitionTable::Gpt);
        for info in &device.partitions {
            let Some(mut part) = existing_partition(host, target, info) else {
                continue;
            };
            if let Some(mountpoint) = part.mountpoint.clone()
                && let Some(flag) = flag_for(&mountpoint, part.fs_type, host.firmware)
            {
                part = part.with_flag(flag);
            }
            debug!("Found {} mounted in the target", part.describe());
            modification.add_partition(part);
        }
        if !modification.partitions.is_empty() {
            device_modifications.push(modification);
        }
    }

    let mut layout = DiskLayoutConfiguration::pre_mount(target);
    layout.device_modifications = device_modifications;

    if layout.root().is_none() {
        return Err(InstallError::Configuration(format!(
            "nothing is mounted at {}",
            target.display()
        )));
    }
    info!(
        "Detected {} pre-mounted partition(s) under {}",
        layout.partitions().count(),
        target.display()
    );
    Ok(layout)
}
