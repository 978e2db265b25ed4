// SPDX-License-Identifier: GPL-3.0-only

//! Unlocking and mounting a planned layout under the target
//!
//! The plan is only borrowed. Every container this module opens is kept in a
//! [`MountState`] keyed by the plan element's object id, so the handles stay
//! reachable for locking even when mounting stops half way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use installer_sys::{CommandRunner, Luks2, lvm, mount, zfs};
use installer_types::device::strip_root;
use installer_types::{
    DeviceModification, DiskEncryption, DiskLayoutConfiguration, EncryptionType, FilesystemType,
    LvmVolume, PartitionModification, SubvolumeModification, ZfsPool,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{InstallError, Result};

const ESP_MASKS: [&str; 2] = ["fmask=0077", "dmask=0077"];

/// Runtime handles created while mounting
#[derive(Debug, Default)]
pub struct MountState<'r> {
    luks: BTreeMap<Uuid, Luks2<'r>>,

    /// Extra fstab lines, e.g. for swap on an unlocked container
    pub fstab_entries: Vec<String>,
}

impl<'r> MountState<'r> {
    pub fn new() -> Self {
        Self {
            luks: BTreeMap::new(),
            fstab_entries: Vec::new(),
        }
    }

    pub fn handle(&self, obj_id: &Uuid) -> Option<&Luks2<'r>> {
        self.luks.get(obj_id)
    }

    pub fn unlocked(&self) -> impl Iterator<Item = (&Uuid, &Luks2<'r>)> {
        self.luks.iter().filter(|(_, h)| h.is_unlocked())
    }

    /// Lock every container still open, continuing past failures
    pub fn lock_all(&mut self) -> usize {
        let mut failed = 0;
        for handle in self.luks.values_mut() {
            if let Err(e) = handle.lock() {
                warn!("Failed to lock {}: {e}", handle.mapper_name());
                failed += 1;
            }
        }
        failed
    }
}

fn under_target(target: &Path, mountpoint: &Path) -> PathBuf {
    let relative = strip_root(mountpoint);
    if relative.as_os_str().is_empty() {
        target.to_path_buf()
    } else {
        target.join(relative)
    }
}

/// Sort key for mount order: mountpoint (containers count as `/`), then
/// real mountpoints before containers, then plan position
fn mount_key(mountpoint: Option<&Path>, index: usize) -> (PathBuf, bool, usize) {
    (
        mountpoint.map_or_else(|| PathBuf::from("/"), Path::to_path_buf),
        mountpoint.is_none(),
        index,
    )
}

/// Device modifications with the one holding the root partition first
pub fn device_mount_order(layout: &DiskLayoutConfiguration) -> Vec<&DeviceModification> {
    let mut devices: Vec<&DeviceModification> = layout.device_modifications.iter().collect();
    if let Some(index) = devices
        .iter()
        .position(|d| d.partitions.iter().any(PartitionModification::is_root))
    {
        let root_device = devices.remove(index);
        devices.insert(0, root_device);
    }
    devices
}

/// Every mountable partition in the order it is mounted
///
/// Physical volumes and ZFS vdevs are skipped.
pub fn partition_mount_order(layout: &DiskLayoutConfiguration) -> Vec<&PartitionModification> {
    device_mount_order(layout)
        .into_iter()
        .flat_map(|device| {
            let mut parts: Vec<(usize, &PartitionModification)> = device
                .partitions
                .iter()
                .enumerate()
                .filter(|(_, p)| !layout.is_container_member(&p.obj_id))
                .collect();
            parts.sort_by_key(|(i, p)| mount_key(p.mountpoint.as_deref(), *i));
            parts.into_iter().map(|(_, p)| p)
        })
        .collect()
}

/// Logical volumes in mount order, group by group
pub fn volume_mount_order(layout: &DiskLayoutConfiguration) -> Vec<&LvmVolume> {
    let Some(lvm) = &layout.lvm_config else {
        return Vec::new();
    };
    lvm.vol_groups
        .iter()
        .flat_map(|group| {
            let mut volumes: Vec<(usize, &LvmVolume)> = group.volumes.iter().enumerate().collect();
            volumes.sort_by_key(|(i, v)| mount_key(v.mountpoint.as_deref(), *i));
            volumes.into_iter().map(|(_, v)| v)
        })
        .collect()
}

/// Unlock, import and mount the layout at `target`
pub fn mount_ordered_layout<'r>(
    runner: &'r dyn CommandRunner,
    target: &Path,
    layout: &DiskLayoutConfiguration,
    state: &mut MountState<'r>,
) -> Result<()> {
    info!("Mounting ordered layout at {}", target.display());
    let encryption = layout.encryption();

    if let Some(zfs_config) = &layout.zfs_config {
        mount_zfs(runner, target, &zfs_config.pool)?;
    }

    match encryption.encryption_type() {
        EncryptionType::NoEncryption => {
            import_lvm(runner, layout)?;
            mount_lvm_layout(runner, target, layout, state)?;
        }
        EncryptionType::Luks => {
            unlock_partitions(runner, layout, &encryption, state)?;
        }
        EncryptionType::LvmOnLuks => {
            unlock_partitions(runner, layout, &encryption, state)?;
            if layout.lvm_config.is_some() {
                lvm::vg_scan(runner)?;
            }
            import_lvm(runner, layout)?;
            mount_lvm_layout(runner, target, layout, state)?;
        }
        EncryptionType::LuksOnLvm => {
            import_lvm(runner, layout)?;
            unlock_volumes(runner, layout, &encryption, state)?;
            mount_lvm_layout(runner, target, layout, state)?;
        }
    }

    mount_partition_layout(runner, target, layout, state)
}

fn unlock_partitions<'r>(
    runner: &'r dyn CommandRunner,
    layout: &DiskLayoutConfiguration,
    encryption: &DiskEncryption,
    state: &mut MountState<'r>,
) -> Result<()> {
    for part in layout
        .partitions()
        .filter(|p| encryption.partitions().contains(&p.obj_id))
    {
        let handle = Luks2::new(
            runner,
            part.safe_dev_path()?,
            part.mapper_name()?,
            encryption.password().cloned(),
        );
        unlock_into(state, part.obj_id, handle)?;
    }
    Ok(())
}

fn unlock_volumes<'r>(
    runner: &'r dyn CommandRunner,
    layout: &DiskLayoutConfiguration,
    encryption: &DiskEncryption,
    state: &mut MountState<'r>,
) -> Result<()> {
    let Some(lvm_config) = &layout.lvm_config else {
        return Ok(());
    };
    for volume in lvm_config
        .volumes()
        .filter(|v| encryption.lvm_volumes().contains(&v.obj_id))
    {
        let handle = Luks2::new(
            runner,
            volume.safe_dev_path()?,
            volume.mapper_name()?,
            encryption.password().cloned(),
        );
        unlock_into(state, volume.obj_id, handle)?;
    }
    Ok(())
}

fn unlock_into<'r>(state: &mut MountState<'r>, obj_id: Uuid, handle: Luks2<'r>) -> Result<()> {
    info!(
        "Unlocking {} as {}",
        handle.luks_dev_path().display(),
        handle.mapper_name()
    );
    let handle = state.luks.entry(obj_id).or_insert(handle);
    handle.unlock().map_err(|e| {
        InstallError::disk(format!("unlocking {}", handle.luks_dev_path().display()), e)
    })
}

fn import_lvm(runner: &dyn CommandRunner, layout: &DiskLayoutConfiguration) -> Result<()> {
    let Some(lvm_config) = &layout.lvm_config else {
        debug!("No LVM configuration to import");
        return Ok(());
    };
    for group in &lvm_config.vol_groups {
        lvm::vg_activate(runner, &group.name)?;
        for volume in &group.volumes {
            lvm::lv_activate(runner, &volume.safe_dev_path()?)?;
        }
    }
    Ok(())
}

fn mount_zfs(runner: &dyn CommandRunner, target: &Path, pool: &ZfsPool) -> Result<()> {
    zfs::zpool_import(runner, &pool.name, target)?;
    // canmount=noauto keeps the root out of `mount -a`
    if let Some(root) = pool.root_dataset() {
        zfs::zfs_mount(runner, &pool.full_name(root))?;
    }
    zfs::zfs_mount_all(runner)?;
    Ok(())
}

fn mount_lvm_layout(
    runner: &dyn CommandRunner,
    target: &Path,
    layout: &DiskLayoutConfiguration,
    state: &mut MountState<'_>,
) -> Result<()> {
    for volume in volume_mount_order(layout) {
        let device = match state.luks.get(&volume.obj_id) {
            Some(handle) => handle.mapper_dev().ok_or_else(|| {
                InstallError::Disk(format!("{} is not unlocked", handle.mapper_name()))
            })?,
            None => volume.safe_dev_path()?,
        };
        let wrapped = state.luks.contains_key(&volume.obj_id);

        if volume.fs_type == FilesystemType::Btrfs {
            mount_subvolumes(runner, target, &device, &volume.btrfs_subvols, &volume.mount_options)?;
        } else if volume.is_swap() {
            mount::swapon(runner, &device)?;
            if wrapped {
                state.fstab_entries.push(swap_entry(&device));
            }
        } else if let Some(mountpoint) = &volume.mountpoint {
            mount::mount(
                runner,
                &device,
                &under_target(target, mountpoint),
                Some(volume.fs_type.mount_type()),
                &volume.mount_options,
            )?;
        }
    }
    Ok(())
}

fn mount_partition_layout(
    runner: &dyn CommandRunner,
    target: &Path,
    layout: &DiskLayoutConfiguration,
    state: &mut MountState<'_>,
) -> Result<()> {
    for part in partition_mount_order(layout) {
        match state.luks.get(&part.obj_id) {
            Some(handle) => {
                let mapper = handle.mapper_dev().ok_or_else(|| {
                    InstallError::Disk(format!("{} is not unlocked", handle.mapper_name()))
                })?;
                if let Some(entry) = mount_luks_partition(runner, target, part, &mapper)? {
                    state.fstab_entries.push(entry);
                }
            }
            None => mount_partition(runner, target, part)?,
        }
    }
    Ok(())
}

fn mount_partition(runner: &dyn CommandRunner, target: &Path, part: &PartitionModification) -> Result<()> {
    let Some(dev) = part.dev_path.as_deref() else {
        debug!("Skipping {}, it has no device path", part.describe());
        return Ok(());
    };

    if let Some(mountpoint) = &part.mountpoint {
        let mut options = part.mount_options.clone();
        if part.is_efi() && part.fs_type.is_some_and(FilesystemType::is_fat) {
            for mask in ESP_MASKS {
                if !options.iter().any(|o| o == mask) {
                    options.push(mask.to_string());
                }
            }
        }
        mount::mount(
            runner,
            dev,
            &under_target(target, mountpoint),
            part.fs_type.map(FilesystemType::mount_type),
            &options,
        )?;
    } else if part.fs_type == Some(FilesystemType::Btrfs) {
        mount_subvolumes(runner, target, dev, &part.btrfs_subvols, &part.mount_options)?;
    } else if part.is_swap() {
        mount::swapon(runner, dev)?;
    }
    Ok(())
}

/// Returns an fstab line when the container holds swap
fn mount_luks_partition(
    runner: &dyn CommandRunner,
    target: &Path,
    part: &PartitionModification,
    mapper: &Path,
) -> Result<Option<String>> {
    if part.fs_type == Some(FilesystemType::Btrfs) && !part.btrfs_subvols.is_empty() {
        mount_subvolumes(runner, target, mapper, &part.btrfs_subvols, &part.mount_options)?;
    } else if part.is_swap() {
        mount::swapon(runner, mapper)?;
        return Ok(Some(swap_entry(mapper)));
    } else if let Some(mountpoint) = &part.mountpoint {
        mount::mount(
            runner,
            mapper,
            &under_target(target, mountpoint),
            part.fs_type.map(FilesystemType::mount_type),
            &part.mount_options,
        )?;
    }
    Ok(None)
}

fn swap_entry(device: &Path) -> String {
    format!("{}\tnone\tswap\tdefaults\t0\t0", device.display())
}

fn mount_subvolumes(
    runner: &dyn CommandRunner,
    target: &Path,
    device: &Path,
    subvolumes: &[SubvolumeModification],
    mount_options: &[String],
) -> Result<()> {
    let mut subvolumes: Vec<&SubvolumeModification> =
        subvolumes.iter().filter(|s| s.mountpoint.is_some()).collect();
    subvolumes.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));

    for subvol in subvolumes {
        let Some(mountpoint) = &subvol.mountpoint else {
            continue;
        };
        let mut options = mount_options.to_vec();
        options.push(format!("subvol={}", subvol.name.display()));
        mount::mount(
            runner,
            device,
            &under_target(target, mountpoint),
            Some("btrfs"),
            &options,
        )?;
    }
    Ok(())
}
