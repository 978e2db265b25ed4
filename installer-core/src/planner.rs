// SPDX-License-Identifier: GPL-3.0-only

//! Suggested layouts for a single disk
//!
//! The planner only produces values; nothing here touches a device. Choices
//! that would be interactive questions come from a [`LayoutPrompter`], which
//! the unattended CLI answers from the plan file.

use installer_sys::Firmware;
use installer_types::{
    BlockDevice, Bootloader, DeviceModification, DiskLayoutConfiguration, DiskLayoutType,
    FilesystemType, LvmConfiguration, LvmLayoutType, LvmVolume, LvmVolumeGroup, PartitionFlag,
    PartitionModification, PartitionTable, SectorSize, Size, SubvolumeModification, Unit,
    ZfsConfiguration, ZfsLayoutType, ZfsPool, default_zfs_datasets,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{InstallError, Result};

/// Devices smaller than this never get a separate `/home`
pub const MIN_SIZE_FOR_SEPARATE_HOME_GIB: u64 = 64;

pub const DEFAULT_VG_NAME: &str = "ArchVg";
pub const DEFAULT_ZFS_POOL: &str = "zpool";
pub const DEFAULT_ZFS_PREFIX: &str = "arch";

/// Answers the questions an interactive front end would ask
pub trait LayoutPrompter {
    fn filesystem(&self) -> Result<FilesystemType>;
    fn separate_home(&self) -> bool;
    fn use_subvolumes(&self) -> bool;
}

/// Prompter for unattended runs
///
/// A filesystem must be given up front; yes/no questions default to yes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unattended;

impl LayoutPrompter for Unattended {
    fn filesystem(&self) -> Result<FilesystemType> {
        Err(InstallError::Configuration(
            "no filesystem selected for the suggested layout".into(),
        ))
    }

    fn separate_home(&self) -> bool {
        true
    }

    fn use_subvolumes(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayoutOptions {
    pub filesystem: Option<FilesystemType>,
    pub separate_home: Option<bool>,
    pub use_subvolumes: Option<bool>,
    pub mount_options: Vec<String>,
    pub bootloader: Bootloader,
    pub partition_table: Option<PartitionTable>,
}

/// `@`, `@home`, `@log` and `@pkg`
pub fn default_btrfs_subvolumes() -> Vec<SubvolumeModification> {
    vec![
        SubvolumeModification::new("@", Some("/")),
        SubvolumeModification::new("@home", Some("/home")),
        SubvolumeModification::new("@log", Some("/var/log")),
        SubvolumeModification::new("@pkg", Some("/var/cache/pacman/pkg")),
    ]
}

/// Root size for a device or volume group of `total` bytes
///
/// Over 500 GiB gets 50 GiB, under 320 GiB gets 32 GiB, anything in between
/// gets a tenth of its whole GiB count.
pub fn process_root_partition_size(total: Size, sector_size: SectorSize) -> Size {
    let total_gib = total.convert(Unit::GiB, None).value;

    let root_gib = if total_gib > 500 {
        50
    } else if total_gib < 320 {
        32
    } else {
        total_gib / 10
    };
    Size::gib(root_gib, sector_size)
}

/// Boot partitions for the given firmware, in disk order
pub fn boot_partitions(
    sector_size: SectorSize,
    partition_table: PartitionTable,
    firmware: Firmware,
    bootloader: Bootloader,
    root_fs: FilesystemType,
    using_subvolumes: bool,
) -> Vec<PartitionModification> {
    let mut start = Size::mib(1, sector_size);
    let mut parts = Vec::new();

    if firmware.uefi {
        let mountpoint = if using_subvolumes { "/efi" } else { "/boot" };
        parts.push(
            PartitionModification::create(
                start,
                Size::gib(1, sector_size),
                Some(FilesystemType::Fat32),
            )
            .with_mountpoint(mountpoint)
            .with_flag(PartitionFlag::Esp),
        );
        return parts;
    }

    // Limine embeds itself in the post-MBR gap, GRUB needs its own partition on GPT
    if partition_table.is_gpt() && bootloader == Bootloader::Grub {
        parts.push(
            PartitionModification::create(start, Size::mib(1, sector_size), None)
                .with_flag(PartitionFlag::BiosGrub),
        );
        start = Size::mib(2, sector_size);
    }

    let boot_fs = if bootloader == Bootloader::Limine {
        FilesystemType::Fat32
    } else {
        root_fs
    };
    parts.push(
        PartitionModification::create(start, Size::gib(1, sector_size), Some(boot_fs))
            .with_mountpoint("/boot")
            .with_flag(PartitionFlag::Boot),
    );
    parts
}

fn resolve_table(opts: &LayoutOptions, firmware: Firmware) -> Result<PartitionTable> {
    let table = opts.partition_table.unwrap_or(if firmware.uefi {
        PartitionTable::Gpt
    } else {
        PartitionTable::Mbr
    });
    if firmware.uefi && !table.is_gpt() {
        return Err(InstallError::Configuration(
            "MBR partition tables are only supported on BIOS systems".into(),
        ));
    }
    Ok(table)
}

/// Boot partition(s), root, and optionally `/home` filling one disk
pub fn suggest_single_disk_layout(
    device: &BlockDevice,
    firmware: Firmware,
    opts: &LayoutOptions,
    prompter: &dyn LayoutPrompter,
) -> Result<DeviceModification> {
    let sector_size = device.sector_size;
    let table = resolve_table(opts, firmware)?;
    let fs = match opts.filesystem {
        Some(fs) => fs,
        None => prompter.filesystem()?,
    };

    let using_subvolumes = fs == FilesystemType::Btrfs
        && opts
            .use_subvolumes
            .unwrap_or_else(|| prompter.use_subvolumes());

    let mut available = device.total_size;
    if table.is_gpt() {
        available = available.gpt_end();
    }
    let available = available.align();

    let mut modification = DeviceModification::new(device.clone(), true, table);
    let boot = boot_partitions(sector_size, table, firmware, opts.bootloader, fs, using_subvolumes);
    let root_start = boot
        .last()
        .map_or(Size::mib(1, sector_size), PartitionModification::end);
    for part in boot {
        modification.add_partition(part);
    }

    let small_device =
        device.total_size < Size::gib(MIN_SIZE_FOR_SEPARATE_HOME_GIB, sector_size);
    let separate_home = if using_subvolumes || small_device {
        false
    } else {
        opts.separate_home
            .unwrap_or_else(|| prompter.separate_home())
    };

    let root_length = if separate_home {
        process_root_partition_size(device.total_size, sector_size)
    } else {
        available - root_start
    };

    let mut root = PartitionModification::create(root_start, root_length, Some(fs))
        .with_mount_options(opts.mount_options.clone());
    if using_subvolumes {
        root = root.with_subvolumes(default_btrfs_subvolumes());
    } else {
        root = root.with_mountpoint("/");
    }
    let root_end = root.end();
    modification.add_partition(root);

    if separate_home {
        if root_end >= available {
            return Err(InstallError::Configuration(format!(
                "{} is too small for separate root and home partitions",
                device.path.display()
            )));
        }
        let mut home = PartitionModification::create(root_end, available - root_end, Some(fs))
            .with_mountpoint("/home")
            .with_mount_options(opts.mount_options.clone());
        if table.is_gpt() {
            home = home.with_flag(PartitionFlag::LinuxHome);
        }
        modification.add_partition(home);
    }

    info!(
        "Suggested {} partitions on {} ({})",
        modification.partitions.len(),
        device.path.display(),
        device.total_size
    );
    Ok(modification)
}

/// Root and home logical volumes over every non-boot partition of a default layout
pub fn suggest_lvm_layout(
    disk_config: &DiskLayoutConfiguration,
    opts: &LayoutOptions,
    prompter: &dyn LayoutPrompter,
    vg_name: &str,
) -> Result<LvmConfiguration> {
    if disk_config.config_type != DiskLayoutType::Default {
        return Err(InstallError::Configuration(
            "LVM suggested volumes are only available for default partitioning".into(),
        ));
    }

    let fs = match opts.filesystem {
        Some(fs) => fs,
        None => prompter.filesystem()?,
    };
    let using_subvolumes = fs == FilesystemType::Btrfs
        && opts
            .use_subvolumes
            .unwrap_or_else(|| prompter.use_subvolumes());

    let boot = disk_config
        .partitions()
        .find(|p| p.is_boot())
        .or_else(|| disk_config.efi_partition())
        .ok_or_else(|| {
            InstallError::Configuration("unable to find a boot partition in the layout".into())
        })?;

    let pvs: Vec<&PartitionModification> = disk_config
        .partitions()
        .filter(|p| p.obj_id != boot.obj_id && !p.is_efi() && !p.is_bios_grub())
        .collect();
    if pvs.is_empty() {
        return Err(InstallError::Configuration(
            "no partitions left to use as physical volumes".into(),
        ));
    }

    let sector_size = SectorSize::default();
    let total = pvs
        .iter()
        .fold(Size::from_bytes(0, sector_size), |acc, p| acc + p.length);
    let root_size = process_root_partition_size(total, sector_size);
    let home_size = total - root_size;
    debug!("LVM capacity {total}, root {root_size}, home {home_size}");

    let pv_ids: Vec<Uuid> = pvs.iter().map(|p| p.obj_id).collect();
    let mut group = LvmVolumeGroup::new(vg_name, pv_ids);

    let mut root = LvmVolume::new("root", fs, root_size)
        .with_mountpoint("/")
        .with_mount_options(opts.mount_options.clone());
    if using_subvolumes {
        root = root.with_subvolumes(default_btrfs_subvolumes());
    }
    group.add_volume(root);

    if !using_subvolumes {
        group.add_volume(LvmVolume::new("home", fs, home_size).with_mountpoint("/home"));
    }

    Ok(LvmConfiguration {
        config_type: LvmLayoutType::Default,
        vol_groups: vec![group],
    })
}

/// An ESP plus one partition consumed by a ZFS pool
pub fn suggest_zfs_layout(
    device: &BlockDevice,
    firmware: Firmware,
    pool_name: &str,
    dataset_prefix: &str,
) -> Result<DiskLayoutConfiguration> {
    if !firmware.uefi {
        return Err(InstallError::HardwareIncompatibility(
            "ZFS requires UEFI boot".into(),
        ));
    }

    let sector_size = device.sector_size;
    let available = device.total_size.gpt_end().align();
    let mut modification = DeviceModification::new(device.clone(), true, PartitionTable::Gpt);

    let esp = PartitionModification::create(
        Size::mib(1, sector_size),
        Size::gib(1, sector_size),
        Some(FilesystemType::Fat32),
    )
    .with_mountpoint("/boot")
    .with_flag(PartitionFlag::Esp);
    let zfs_start = esp.end();
    modification.add_partition(esp);

    let vdev = PartitionModification::create(zfs_start, available - zfs_start, None);
    let vdev_id = vdev.obj_id;
    modification.add_partition(vdev);

    let mut layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![modification]);
    layout.zfs_config = Some(ZfsConfiguration {
        config_type: ZfsLayoutType::Default,
        pool: ZfsPool {
            name: pool_name.to_string(),
            pvs: vec![vdev_id],
            dataset_prefix: dataset_prefix.to_string(),
            datasets: default_zfs_datasets(),
            compression: "lz4".to_string(),
            mountpoint: "/mnt".into(),
        },
    });
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;

    fn ss() -> SectorSize {
        SectorSize::default()
    }

    fn disk(gib: u64) -> BlockDevice {
        BlockDevice {
            path: PathBuf::from("/dev/nvme0n1"),
            model: Some("Samsung SSD 980".into()),
            total_size: Size::gib(gib, ss()),
            sector_size: ss(),
            partitions: Vec::new(),
        }
    }

    fn ext4() -> LayoutOptions {
        LayoutOptions {
            filesystem: Some(FilesystemType::Ext4),
            separate_home: Some(true),
            ..LayoutOptions::default()
        }
    }

    #[test]
    fn root_size_policy_thresholds() {
        let size = |gib| process_root_partition_size(Size::gib(gib, ss()), ss());
        assert_eq!(size(600), Size::gib(50, ss()));
        assert_eq!(size(200), Size::gib(32, ss()));
        assert_eq!(size(400), Size::gib(40, ss()));
        assert_eq!(size(320), Size::gib(32, ss()));
        assert_eq!(size(500), Size::gib(50, ss()));
    }

    #[test]
    fn uefi_layout_with_home() {
        let dm = suggest_single_disk_layout(&disk(400), Firmware::UEFI64, &ext4(), &Unattended)
            .unwrap();
        assert_eq!(dm.partition_table, PartitionTable::Gpt);
        assert_eq!(dm.partitions.len(), 3);

        let esp = &dm.partitions[0];
        assert!(esp.is_efi());
        assert_eq!(esp.mountpoint.as_deref(), Some(Path::new("/boot")));
        assert_eq!(esp.start, Size::mib(1, ss()));

        let root = &dm.partitions[1];
        assert_eq!(root.start, esp.end());
        assert_eq!(root.length, Size::gib(40, ss()));

        let home = &dm.partitions[2];
        assert!(home.is_home());
        assert!(home.has_flag(PartitionFlag::LinuxHome));
        assert_eq!(home.end(), disk(400).total_size.gpt_end().align());
    }

    #[test]
    fn subvolumes_suppress_home_and_move_esp() {
        let opts = LayoutOptions {
            filesystem: Some(FilesystemType::Btrfs),
            use_subvolumes: Some(true),
            separate_home: Some(true),
            mount_options: vec!["compress=zstd".into()],
            ..LayoutOptions::default()
        };
        let dm = suggest_single_disk_layout(&disk(400), Firmware::UEFI64, &opts, &Unattended)
            .unwrap();
        assert_eq!(dm.partitions.len(), 2);
        assert_eq!(dm.partitions[0].mountpoint.as_deref(), Some(Path::new("/efi")));

        let root = &dm.partitions[1];
        assert!(root.mountpoint.is_none());
        assert!(root.is_root());
        assert_eq!(root.btrfs_subvols.len(), 4);
        assert_eq!(root.mount_options, vec!["compress=zstd".to_string()]);
    }

    #[test]
    fn small_disk_has_no_home() {
        let dm = suggest_single_disk_layout(&disk(32), Firmware::UEFI64, &ext4(), &Unattended)
            .unwrap();
        assert_eq!(dm.partitions.len(), 2);
        assert_eq!(dm.partitions[1].end(), disk(32).total_size.gpt_end().align());
    }

    #[test]
    fn bios_gpt_grub_gets_bios_boot_partition() {
        let opts = LayoutOptions {
            partition_table: Some(PartitionTable::Gpt),
            ..ext4()
        };
        let dm = suggest_single_disk_layout(&disk(100), Firmware::BIOS, &opts, &Unattended)
            .unwrap();
        assert!(dm.partitions[0].is_bios_grub());
        assert_eq!(dm.partitions[0].length, Size::mib(1, ss()));
        assert_eq!(dm.partitions[1].start, Size::mib(2, ss()));
        assert!(dm.partitions[1].is_boot());
        assert_eq!(dm.partitions[1].fs_type, Some(FilesystemType::Ext4));
    }

    #[test]
    fn bios_limine_uses_fat_boot_without_bios_partition() {
        let opts = LayoutOptions {
            bootloader: Bootloader::Limine,
            partition_table: Some(PartitionTable::Gpt),
            ..ext4()
        };
        let dm = suggest_single_disk_layout(&disk(100), Firmware::BIOS, &opts, &Unattended)
            .unwrap();
        assert!(!dm.partitions.iter().any(|p| p.is_bios_grub()));
        assert_eq!(dm.partitions[0].fs_type, Some(FilesystemType::Fat32));
        assert_eq!(dm.partitions[0].start, Size::mib(1, ss()));
    }

    #[test]
    fn mbr_on_uefi_is_rejected() {
        let opts = LayoutOptions {
            partition_table: Some(PartitionTable::Mbr),
            ..ext4()
        };
        let err = suggest_single_disk_layout(&disk(100), Firmware::UEFI64, &opts, &Unattended)
            .unwrap_err();
        assert!(matches!(err, InstallError::Configuration(_)));
    }

    #[test]
    fn unattended_without_filesystem_is_a_configuration_error() {
        let err = suggest_single_disk_layout(
            &disk(100),
            Firmware::UEFI64,
            &LayoutOptions::default(),
            &Unattended,
        )
        .unwrap_err();
        assert!(matches!(err, InstallError::Configuration(_)));
    }

    #[test]
    fn lvm_layout_spans_non_boot_partitions() {
        let dm = suggest_single_disk_layout(&disk(600), Firmware::UEFI64, &ext4(), &Unattended)
            .unwrap();
        let expected: Vec<Uuid> = dm.partitions[1..].iter().map(|p| p.obj_id).collect();
        let layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dm]);

        let lvm = suggest_lvm_layout(&layout, &ext4(), &Unattended, DEFAULT_VG_NAME).unwrap();
        let group = &lvm.vol_groups[0];
        assert_eq!(group.name, "ArchVg");
        assert_eq!(group.pvs, expected);

        let root = lvm.root_volume().unwrap();
        assert_eq!(root.length, Size::gib(50, ss()));
        assert_eq!(root.vg_name.as_deref(), Some("ArchVg"));
        let home = lvm.volumes().find(|v| v.name == "home").unwrap();
        let total: u64 = layout.partitions().skip(1).map(|p| p.length.bytes()).sum();
        assert_eq!(home.length.bytes(), total - root.length.bytes());
    }

    #[test]
    fn lvm_layout_requires_default_partitioning() {
        let layout = DiskLayoutConfiguration::pre_mount("/mnt");
        assert!(suggest_lvm_layout(&layout, &ext4(), &Unattended, DEFAULT_VG_NAME).is_err());
    }

    #[test]
    fn zfs_requires_uefi() {
        let err = suggest_zfs_layout(&disk(100), Firmware::BIOS, DEFAULT_ZFS_POOL, DEFAULT_ZFS_PREFIX)
            .unwrap_err();
        assert!(matches!(err, InstallError::HardwareIncompatibility(_)));

        let layout =
            suggest_zfs_layout(&disk(100), Firmware::UEFI64, DEFAULT_ZFS_POOL, DEFAULT_ZFS_PREFIX)
                .unwrap();
        let zfs = layout.zfs_config.as_ref().unwrap();
        let vdev = layout.partition(&zfs.pool.pvs[0]).unwrap();
        assert!(vdev.fs_type.is_none());
        assert!(layout.is_container_member(&vdev.obj_id));
        assert!(matches!(
            layout.root(),
            Some(installer_types::RootElement::Dataset { .. })
        ));
    }
}
