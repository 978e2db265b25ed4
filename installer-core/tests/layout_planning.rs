// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::path::Path;

use installer_core::cmdline::{LVM_MAPPER, RootIdentity, RootSpec, kernel_params, resolve_root};
use installer_core::mount::{partition_mount_order, volume_mount_order};
use installer_core::planner::{LayoutOptions, Unattended, process_root_partition_size, suggest_single_disk_layout};
use installer_core::{ErrorKind, validate_bootloader, with_planned_paths};
use installer_sys::testing::ScriptedRunner;
use installer_sys::{CommandOutput, Firmware};
use installer_types::{
    Bootloader, BootloaderConfiguration, DiskEncryption, DiskLayoutConfiguration, DiskLayoutType,
    EncryptionType, FilesystemType, InstallPlan, Password, SectorSize, Size,
};

use common::{Rig, disk, ext4_single_root, luks_root_layout, lvm_on_luks_layout};

#[test]
fn root_size_follows_capacity() {
    let ss = SectorSize::default();
    for (total, root) in [(600, 50), (200, 32), (400, 40)] {
        assert_eq!(process_root_partition_size(Size::gib(total, ss), ss), Size::gib(root, ss));
    }
}

#[test]
fn suggested_partitions_stay_aligned() {
    let dm = suggest_single_disk_layout(&disk("/dev/nvme0n1", 500), Firmware::UEFI64, &ext4_single_root(), &Unattended)
        .unwrap();
    for part in &dm.partitions {
        assert!(part.start.is_aligned(), "{} starts off alignment", part.describe());
        assert!(part.length.is_aligned(), "{} has an unaligned length", part.describe());
    }
    let last = dm.partitions.last().unwrap();
    assert!(last.end() <= Size::gib(500, SectorSize::default()).gpt_end());
}

#[test]
fn planned_paths_follow_disk_naming() {
    let layout = with_planned_paths(&luks_root_layout(Firmware::UEFI64));
    let paths: Vec<_> = layout.partitions().filter_map(|p| p.dev_path.clone()).collect();
    assert_eq!(paths, vec![Path::new("/dev/sda1"), Path::new("/dev/sda2")]);
}

#[test]
fn physical_volumes_are_not_mounted_directly() {
    let layout = with_planned_paths(&lvm_on_luks_layout(600));
    let order: Vec<_> = partition_mount_order(&layout)
        .iter()
        .map(|p| p.mountpoint.clone())
        .collect();
    assert_eq!(order, vec![Some("/boot".into())]);

    let volumes: Vec<_> = volume_mount_order(&layout).iter().map(|v| v.name.as_str()).collect();
    assert_eq!(volumes, vec!["root", "home"]);
}

#[test]
fn luks_on_lvm_drops_partitions_from_the_encrypted_set() {
    let layout = lvm_on_luks_layout(600);
    let partition = layout.partitions().last().unwrap().obj_id;
    let volume = layout.lvm_config.as_ref().unwrap().volumes().next().unwrap().obj_id;

    let encryption = DiskEncryption::new(
        EncryptionType::LuksOnLvm,
        Some(Password::new("hunter2")),
        [partition],
        [volume],
    )
    .unwrap();
    assert!(encryption.partitions().is_empty());
    assert!(encryption.contains(&volume));
}

#[test]
fn lvm_on_luks_root_opens_the_container_by_header_uuid() {
    let rig = Rig::new(
        Firmware::UEFI64,
        ScriptedRunner::new()
            .respond("pvs --segments", CommandOutput::stdout("  /dev/mapper/luks-sda2\tArchVg\troot\n"))
            .respond("cryptsetup luksUUID /dev/sda2", CommandOutput::stdout("aaaa-bbbb\n")),
    );
    let layout = with_planned_paths(&lvm_on_luks_layout(600));

    let root = resolve_root(&rig.host(), &layout).unwrap();
    assert!(matches!(root.spec, RootSpec::LvmOnLuks { .. }));
    assert_eq!(
        kernel_params(&root, RootIdentity::PartUuid, false, &["quiet".into()]),
        vec![
            format!("rd.luks.name=aaaa-bbbb={LVM_MAPPER}"),
            "root=/dev/mapper/ArchVg-root".to_string(),
            "rw".to_string(),
            "rootfstype=ext4".to_string(),
            "quiet".to_string(),
        ]
    );
}

#[test]
fn plain_root_is_named_by_partuuid() {
    let mut layout = with_planned_paths(&luks_root_layout(Firmware::UEFI64));
    layout.disk_encryption = None;
    layout.device_modifications[0].partitions[1].partuuid = Some("0a1b-02".into());

    let rig = Rig::new(Firmware::UEFI64, ScriptedRunner::new());
    let root = resolve_root(&rig.host(), &layout).unwrap();
    assert_eq!(
        kernel_params(&root, RootIdentity::PartUuid, true, &[]),
        vec!["root=PARTUUID=0a1b-02", "zswap.enabled=0", "rw", "rootfstype=ext4"]
    );
    assert!(rig.runner.rendered().is_empty());
}

#[test]
fn limine_needs_a_fat_boot() {
    let opts = LayoutOptions {
        bootloader: Bootloader::Limine,
        ..ext4_single_root()
    };
    let dm = suggest_single_disk_layout(&disk("/dev/sda", 64), Firmware::BIOS, &opts, &Unattended).unwrap();
    let mut layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dm]);
    let config = BootloaderConfiguration {
        bootloader: Bootloader::Limine,
        ..BootloaderConfiguration::default()
    };
    // the planner already gives Limine a FAT /boot
    validate_bootloader(Firmware::BIOS, &layout, config).unwrap();

    let boot = layout.device_modifications[0]
        .partitions
        .iter_mut()
        .find(|p| p.mountpoint.as_deref() == Some(Path::new("/boot")))
        .unwrap();
    boot.fs_type = Some(FilesystemType::Ext4);
    let err = validate_bootloader(Firmware::BIOS, &layout, config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn removable_is_dropped_where_it_means_nothing() {
    let layout = luks_root_layout(Firmware::UEFI64);
    let config = BootloaderConfiguration {
        bootloader: Bootloader::Systemd,
        uki: false,
        removable: true,
    };
    let validated = validate_bootloader(Firmware::UEFI64, &layout, config).unwrap();
    assert!(!validated.removable);
}

#[test]
fn planned_layout_survives_the_plan_file() {
    let mut plan = InstallPlan::new(lvm_on_luks_layout(600));
    plan.bootloader_config.bootloader = Bootloader::Grub;
    plan.kernels = vec!["linux".into(), "linux-lts".into()];

    let text = plan.to_toml().unwrap();
    let parsed = InstallPlan::from_str_with_path(&text, Path::new("/tmp/plan.toml")).unwrap();
    assert_eq!(parsed, plan);
    assert_eq!(
        parsed.disk_config.encryption().encryption_type(),
        EncryptionType::LvmOnLuks
    );
}
