// SPDX-License-Identifier: GPL-3.0-only

//! Writes a planned layout to disk
//!
//! Partition tables go through `sfdisk` scripts, filesystems through the
//! matching `mkfs` tool. The input plan is never modified: the result is a
//! copy carrying the device paths and identifiers the kernel assigned.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use installer_sys::{Cmd, CommandRunner, Luks2, lvm, mount, zfs};
use installer_types::{
    DeviceModification, DiskEncryption, DiskLayoutConfiguration, EncryptionType, FilesystemType,
    LvmConfiguration, LvmVolumeStatus, ModificationStatus, PartitionModification, PartitionTable,
    SubvolumeModification, ZfsPool,
};
use tracing::{debug, info, warn};

use crate::error::{InstallError, Result};
use crate::host::Host;

mod gpt_type {
    pub const ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
    pub const BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
    pub const LINUX_HOME: &str = "933AC7E1-2EB4-4F13-B844-0E14E2AEF915";
    pub const LINUX_LVM: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";
    pub const LINUX_SWAP: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
    pub const LINUX: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
}

/// `/dev/sda` + 2 → `/dev/sda2`, `/dev/nvme0n1` + 2 → `/dev/nvme0n1p2`
pub fn partition_path(disk: &Path, partn: u32) -> PathBuf {
    let disk = disk.display().to_string();
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{disk}p{partn}"))
    } else {
        PathBuf::from(format!("{disk}{partn}"))
    }
}

fn type_code(part: &PartitionModification, table: PartitionTable, is_pv: bool) -> &'static str {
    let gpt = table.is_gpt();
    if part.is_efi() {
        if gpt { gpt_type::ESP } else { "ef" }
    } else if part.is_bios_grub() && gpt {
        gpt_type::BIOS_BOOT
    } else if is_pv {
        if gpt { gpt_type::LINUX_LVM } else { "8e" }
    } else if part.is_swap() {
        if gpt { gpt_type::LINUX_SWAP } else { "82" }
    } else if part.is_home() && gpt {
        gpt_type::LINUX_HOME
    } else if gpt {
        gpt_type::LINUX
    } else {
        "83"
    }
}

/// sfdisk input for the partitions this run creates
///
/// With `wipe` the script starts with a label line and replaces the table.
/// Partitions that already carry a device path are named so sfdisk uses
/// that partition number.
pub fn sfdisk_script(modification: &DeviceModification, lvm: Option<&LvmConfiguration>) -> String {
    let table = modification.partition_table;
    let mut script = String::new();
    if modification.wipe {
        script.push_str(&format!("label: {}\n", table.as_sfdisk_label()));
    }
    script.push_str("unit: sectors\n\n");

    for part in modification
        .partitions
        .iter()
        .filter(|p| p.status == ModificationStatus::Create)
    {
        let is_pv = lvm.is_some_and(|l| l.is_pv(&part.obj_id));
        if let Some(dev) = &part.dev_path {
            script.push_str(&format!("{} : ", dev.display()));
        }
        script.push_str(&format!(
            "start={}, size={}, type={}",
            part.start.sectors(),
            part.length.sectors(),
            type_code(part, table, is_pv)
        ));
        if !table.is_gpt() && (part.is_boot() || part.is_efi()) {
            script.push_str(", bootable");
        }
        script.push('\n');
    }
    script
}

fn mkfs_command(fs: FilesystemType, device: &Path) -> Option<Cmd> {
    let cmd = match fs {
        FilesystemType::Btrfs => Cmd::new("mkfs.btrfs").arg("-f"),
        FilesystemType::Ext2 => Cmd::new("mkfs.ext2").arg("-F"),
        FilesystemType::Ext3 => Cmd::new("mkfs.ext3").arg("-F"),
        FilesystemType::Ext4 => Cmd::new("mkfs.ext4").arg("-F"),
        FilesystemType::F2fs => Cmd::new("mkfs.f2fs").arg("-f"),
        FilesystemType::Fat12 => Cmd::new("mkfs.fat").args(["-F", "12"]),
        FilesystemType::Fat16 => Cmd::new("mkfs.fat").args(["-F", "16"]),
        FilesystemType::Fat32 => Cmd::new("mkfs.fat").args(["-F", "32"]),
        FilesystemType::Ntfs => Cmd::new("mkfs.ntfs").arg("-Q"),
        FilesystemType::Xfs => Cmd::new("mkfs.xfs").arg("-f"),
        FilesystemType::LinuxSwap => Cmd::new("mkswap"),
        FilesystemType::CryptoLuks => return None,
    };
    Some(cmd.path_arg(device))
}

pub fn format_filesystem(runner: &dyn CommandRunner, fs: FilesystemType, device: &Path) -> Result<()> {
    let Some(cmd) = mkfs_command(fs, device) else {
        debug!("No filesystem to create on {}", device.display());
        return Ok(());
    };
    info!("Formatting {} as {}", device.display(), fs.as_str());
    runner
        .run(&cmd)
        .map_err(|e| InstallError::disk(format!("formatting {}", device.display()), e))?;
    Ok(())
}

/// Mount the fresh filesystem on a scratch directory and create subvolumes
pub fn create_subvolumes(
    runner: &dyn CommandRunner,
    device: &Path,
    subvolumes: &[SubvolumeModification],
) -> Result<()> {
    if subvolumes.is_empty() {
        return Ok(());
    }
    let scratch = tempfile::tempdir()?;
    mount::mount(runner, device, scratch.path(), Some("btrfs"), &[])?;

    let created: Result<()> = subvolumes.iter().try_for_each(|subvol| {
        debug!("Creating subvolume {}", subvol.name.display());
        runner.run(
            &Cmd::new("btrfs")
                .args(["subvolume", "create"])
                .path_arg(&scratch.path().join(&subvol.name)),
        )?;
        Ok(())
    });

    let unmounted = mount::umount(runner, scratch.path());
    created?;
    unmounted?;
    Ok(())
}

fn blkid(runner: &dyn CommandRunner, tag: &str, device: &Path) -> Option<String> {
    runner
        .output(&Cmd::new("blkid").args(["-s", tag, "-o", "value"]).path_arg(device))
        .ok()
        .filter(|v| !v.is_empty())
}

fn write_partition_table(runner: &dyn CommandRunner, modification: &DeviceModification, lvm: Option<&LvmConfiguration>) -> Result<()> {
    let disk = &modification.device.path;

    if modification.wipe {
        info!("Wiping {}", disk.display());
        runner.run(&Cmd::new("wipefs").arg("--all").path_arg(disk))?;
    } else {
        for part in modification
            .partitions
            .iter()
            .filter(|p| p.status == ModificationStatus::Delete)
        {
            if let Some(partn) = part.partn {
                info!("Deleting partition {partn} on {}", disk.display());
                runner.run(&Cmd::new("sfdisk").arg("--delete").path_arg(disk).arg(partn.to_string()))?;
            }
        }
    }

    if !modification
        .partitions
        .iter()
        .any(|p| p.status == ModificationStatus::Create)
    {
        return Ok(());
    }

    let mut cmd = Cmd::new("sfdisk");
    if !modification.wipe {
        cmd = cmd.arg("--append");
    }
    let cmd = cmd.path_arg(disk).stdin(sfdisk_script(modification, lvm));
    runner
        .run(&cmd)
        .map_err(|e| InstallError::disk(format!("partitioning {}", disk.display()), e))?;
    runner.run(&Cmd::new("udevadm").arg("settle"))?;
    Ok(())
}

/// Give every created partition its number and device node
///
/// On a kept table a new partition takes the lowest number no surviving
/// partition holds, which is the slot `sfdisk --append` fills. The script
/// names each partition as well, so the two cannot disagree.
fn assign_device_paths(modification: &mut DeviceModification) {
    let disk = modification.device.path.clone();
    let mut taken: BTreeSet<u32> = BTreeSet::new();
    if !modification.wipe {
        let deleted: BTreeSet<u32> = modification
            .partitions
            .iter()
            .filter(|p| p.status == ModificationStatus::Delete)
            .filter_map(|p| p.partn)
            .collect();
        taken.extend(
            modification
                .partitions
                .iter()
                .filter(|p| !matches!(p.status, ModificationStatus::Create | ModificationStatus::Delete))
                .filter_map(|p| p.partn)
                .chain(modification.device.partitions.iter().filter_map(|p| p.partn))
                .filter(|n| !deleted.contains(n)),
        );
    }

    for part in modification.partitions.iter_mut() {
        if part.status == ModificationStatus::Delete {
            continue;
        }
        if part.status != ModificationStatus::Create && !modification.wipe {
            continue;
        }
        let partn = (1..).find(|n| !taken.contains(n)).unwrap_or(1);
        taken.insert(partn);
        part.partn = Some(partn);
        part.dev_path = Some(partition_path(&disk, partn));
    }
}

fn needs_format(part: &PartitionModification) -> bool {
    matches!(
        part.status,
        ModificationStatus::Create | ModificationStatus::Modify
    )
}

fn luks_format(
    runner: &dyn CommandRunner,
    encryption: &DiskEncryption,
    handle: &Luks2<'_>,
) -> Result<()> {
    handle
        .format(encryption.pbkdf(), encryption.iter_time())
        .map_err(|e| InstallError::disk(format!("encrypting {}", handle.luks_dev_path().display()), e))?;
    runner.run(&Cmd::new("udevadm").arg("settle"))?;
    Ok(())
}

/// Format one partition, through a LUKS container when it is in the encrypted set
fn format_partition(
    runner: &dyn CommandRunner,
    encryption: &DiskEncryption,
    part: &PartitionModification,
) -> Result<()> {
    let dev = part.safe_dev_path()?;
    let fs = part.safe_fs_type()?;

    if !encryption.partitions().contains(&part.obj_id) {
        format_filesystem(runner, fs, dev)?;
        return create_subvolumes(runner, dev, &part.btrfs_subvols);
    }

    let mut handle = Luks2::new(runner, dev, part.mapper_name()?, encryption.password().cloned());
    luks_format(runner, encryption, &handle)?;
    let unlocked = handle.unlock_scoped()?;
    let mapper = unlocked
        .mapper_dev()
        .ok_or_else(|| InstallError::Disk(format!("{} did not unlock", unlocked.mapper_name())))?;
    format_filesystem(runner, fs, &mapper)?;
    create_subvolumes(runner, &mapper, &part.btrfs_subvols)
}

fn build_lvm(
    runner: &dyn CommandRunner,
    encryption: &DiskEncryption,
    lvm_config: &mut LvmConfiguration,
    pv_devices: &[(uuid::Uuid, PathBuf)],
) -> Result<()> {
    for group in lvm_config.vol_groups.iter_mut() {
        let devices: Vec<PathBuf> = group
            .pvs
            .iter()
            .filter_map(|id| pv_devices.iter().find(|(pv, _)| pv == id).map(|(_, d)| d.clone()))
            .collect();
        if devices.len() != group.pvs.len() {
            return Err(InstallError::Configuration(format!(
                "volume group {} references partitions that are not in the layout",
                group.name
            )));
        }

        lvm::pv_create(runner, &devices)?;
        lvm::vg_create(runner, &group.name, &devices)?;

        let last = group.volumes.len().saturating_sub(1);
        for (index, volume) in group.volumes.iter_mut().enumerate() {
            if volume.status != LvmVolumeStatus::Create {
                continue;
            }
            volume.vg_name = Some(group.name.clone());
            let size = (index != last).then(|| volume.length.bytes());
            lvm::lv_create(runner, &group.name, &volume.name, size)?;

            let dev = volume.safe_dev_path()?;
            if encryption.lvm_volumes().contains(&volume.obj_id) {
                let mut handle = Luks2::new(runner, dev.clone(), volume.mapper_name()?, encryption.password().cloned());
                luks_format(runner, encryption, &handle)?;
                let unlocked = handle.unlock_scoped()?;
                let mapper = unlocked.mapper_dev().ok_or_else(|| {
                    InstallError::Disk(format!("{} did not unlock", unlocked.mapper_name()))
                })?;
                format_filesystem(runner, volume.fs_type, &mapper)?;
                create_subvolumes(runner, &mapper, &volume.btrfs_subvols)?;
            } else {
                format_filesystem(runner, volume.fs_type, &dev)?;
                create_subvolumes(runner, &dev, &volume.btrfs_subvols)?;
                volume.uuid = blkid(runner, "UUID", &dev);
            }
        }
    }
    Ok(())
}

fn build_zfs(runner: &dyn CommandRunner, pool: &ZfsPool, vdev: &Path) -> Result<()> {
    zfs::load_module(runner)?;
    zfs::zpool_create(runner, pool, vdev)?;
    zfs::create_datasets(runner, pool)?;
    zfs::zpool_set(runner, &pool.name, "cachefile", "none")?;
    if let Some(root) = pool.root_dataset() {
        zfs::zpool_set(runner, &pool.name, "bootfs", &pool.full_name(root))?;
    }
    zfs::zpool_export(runner, &pool.name)?;
    Ok(())
}

/// `layout` with the device paths [`apply_layout`] gives each new partition
pub fn with_planned_paths(layout: &DiskLayoutConfiguration) -> DiskLayoutConfiguration {
    let mut planned = layout.clone();
    for modification in planned.device_modifications.iter_mut() {
        assign_device_paths(modification);
    }
    planned
}

/// Partition, encrypt and format everything the plan creates
pub fn apply_layout(host: &Host<'_>, layout: &DiskLayoutConfiguration) -> Result<DiskLayoutConfiguration> {
    let runner = host.runner;
    let mut applied = layout.clone();
    let encryption = layout.encryption();

    for modification in applied.device_modifications.iter_mut() {
        assign_device_paths(modification);
        write_partition_table(runner, modification, layout.lvm_config.as_ref())?;
    }

    for part in applied.partitions() {
        if !needs_format(part) || applied.is_container_member(&part.obj_id) {
            continue;
        }
        if part.fs_type.is_none() {
            if !part.is_bios_grub() {
                debug!("{} has no filesystem, leaving it raw", part.describe());
            }
            continue;
        }
        format_partition(runner, &encryption, part)?;
    }

    if let Some(lvm_config) = applied.lvm_config.as_mut() {
        let mut containers = Vec::new();
        let mut pv_devices = Vec::new();
        for id in lvm_config.all_pvs() {
            let part = applied
                .device_modifications
                .iter()
                .flat_map(|m| m.partitions.iter())
                .find(|p| p.obj_id == *id)
                .ok_or_else(|| InstallError::Configuration(format!("physical volume {id} is not in the layout")))?;
            let dev = part.safe_dev_path()?.to_path_buf();

            if encryption.encryption_type() == EncryptionType::LvmOnLuks
                && encryption.partitions().contains(id)
            {
                let mut handle = Luks2::new(runner, dev, part.mapper_name()?, encryption.password().cloned());
                luks_format(runner, &encryption, &handle)?;
                handle.unlock()?;
                if let Some(mapper) = handle.mapper_dev() {
                    pv_devices.push((*id, mapper));
                }
                containers.push(handle);
            } else {
                pv_devices.push((*id, dev));
            }
        }

        let built = build_lvm(runner, &encryption, lvm_config, &pv_devices);

        // the VG must be inactive before its containers can close
        for group in &lvm_config.vol_groups {
            if let Err(e) = lvm::vg_deactivate(runner, &group.name) {
                warn!("Failed to deactivate {}: {e}", group.name);
            }
        }
        for handle in containers.iter_mut() {
            if let Err(e) = handle.lock() {
                warn!("Failed to lock {}: {e}", handle.mapper_name());
            }
        }
        built?;
    }

    if let Some(zfs_config) = &applied.zfs_config {
        let vdev = zfs_config
            .pool
            .pvs
            .first()
            .and_then(|id| applied.partition(id))
            .ok_or_else(|| InstallError::Configuration("the ZFS pool has no vdev".into()))?;
        build_zfs(runner, &zfs_config.pool, vdev.safe_dev_path()?)?;
    }

    for modification in applied.device_modifications.iter_mut() {
        for part in modification
            .partitions
            .iter_mut()
            .filter(|p| p.status != ModificationStatus::Delete && p.dev_path.is_some())
        {
            if let Some(dev) = part.dev_path.clone() {
                part.partuuid = blkid(runner, "PARTUUID", &dev).or(part.partuuid.take());
                part.uuid = blkid(runner, "UUID", &dev).or(part.uuid.take());
            }
        }
    }

    info!("Layout applied to {} device(s)", applied.device_modifications.len());
    Ok(applied)
}
