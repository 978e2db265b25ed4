// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use installer_core::Host;
use installer_core::planner::{
    DEFAULT_VG_NAME, LayoutOptions, Unattended, suggest_lvm_layout, suggest_single_disk_layout,
};
use installer_sys::{CpuVendor, Firmware};
use installer_sys::testing::{FakeClock, RecordingInstaller, ScriptedRunner, StaticDevices};
use installer_types::{
    BlockDevice, DiskEncryption, DiskLayoutConfiguration, DiskLayoutType, EncryptionType,
    FilesystemType, Password, SectorSize, Size,
};
use tempfile::TempDir;

/// Scripted stand-ins for everything a [`Host`] borrows
pub struct Rig {
    pub runner: ScriptedRunner,
    pub devices: StaticDevices,
    pub packages: RecordingInstaller,
    pub clock: FakeClock,
    pub firmware: Firmware,
    pub cpu: Option<CpuVendor>,
}

impl Rig {
    pub fn new(firmware: Firmware, runner: ScriptedRunner) -> Self {
        Self {
            runner,
            devices: StaticDevices::default(),
            packages: RecordingInstaller::default(),
            clock: FakeClock::new(),
            firmware,
            cpu: None,
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            runner: &self.runner,
            devices: &self.devices,
            packages: &self.packages,
            clock: &self.clock,
            firmware: self.firmware,
            cpu: self.cpu,
        }
    }
}

pub fn disk(path: &str, gib: u64) -> BlockDevice {
    let ss = SectorSize::default();
    BlockDevice {
        path: PathBuf::from(path),
        model: Some("QEMU HARDDISK".into()),
        total_size: Size::gib(gib, ss),
        sector_size: ss,
        partitions: Vec::new(),
    }
}

pub fn ext4_single_root() -> LayoutOptions {
    LayoutOptions {
        filesystem: Some(FilesystemType::Ext4),
        separate_home: Some(false),
        ..LayoutOptions::default()
    }
}

/// Suggested single disk layout with the root partition encrypted
pub fn luks_root_layout(firmware: Firmware) -> DiskLayoutConfiguration {
    let dm = suggest_single_disk_layout(&disk("/dev/sda", 64), firmware, &ext4_single_root(), &Unattended)
        .unwrap();
    let mut layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dm]);
    let root_id = layout.root().and_then(|r| r.obj_id()).unwrap();
    layout.disk_encryption = Some(
        DiskEncryption::new(EncryptionType::Luks, Some(Password::new("hunter2")), [root_id], []).unwrap(),
    );
    layout
}

/// Suggested layout whose root partition becomes an encrypted physical volume
pub fn lvm_on_luks_layout(gib: u64) -> DiskLayoutConfiguration {
    let dm = suggest_single_disk_layout(&disk("/dev/sda", gib), Firmware::UEFI64, &ext4_single_root(), &Unattended)
        .unwrap();
    let mut layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dm]);
    let lvm = suggest_lvm_layout(&layout, &ext4_single_root(), &Unattended, DEFAULT_VG_NAME).unwrap();
    let pvs: Vec<_> = lvm.all_pvs().copied().collect();
    layout.lvm_config = Some(lvm);
    layout.disk_encryption = Some(
        DiskEncryption::new(EncryptionType::LvmOnLuks, Some(Password::new("hunter2")), pvs, []).unwrap(),
    );
    layout
}

/// Empty target with the files the base system would have put there
pub fn strapped_target() -> TempDir {
    let target = tempfile::tempdir().unwrap();
    fs::create_dir_all(target.path().join("etc")).unwrap();
    fs::create_dir_all(target.path().join("root")).unwrap();
    fs::write(
        target.path().join("etc/mkinitcpio.conf"),
        "MODULES=()\nBINARIES=()\nFILES=()\nHOOKS=(base udev autodetect block filesystems fsck)\n",
    )
    .unwrap();
    target
}
