// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::fs;

use installer_core::{ErrorKind, ReadinessOptions, perform_installation, teardown};
use installer_sys::testing::ScriptedRunner;
use installer_sys::{CommandOutput, Firmware};
use installer_types::{Bootloader, DiskEncryption, EncryptionType, InstallPlan, Password};

use common::{Rig, luks_root_layout, strapped_target};

const OFFLINE: ReadinessOptions = ReadinessOptions {
    skip_ntp: true,
    skip_wkd: true,
    offline: true,
};

#[test]
fn encrypted_root_installs_end_to_end() {
    let target = strapped_target();
    let t = target.path().display().to_string();
    let rig = Rig::new(
        Firmware::UEFI64,
        ScriptedRunner::new()
            .respond("cryptsetup luksUUID /dev/sda2", CommandOutput::stdout("5e1f-0001\n"))
            .respond(&format!("arch-chroot {t} pacman -Q systemd"), CommandOutput::stdout("systemd 258.1-1\n"))
            .respond("genfstab", CommandOutput::stdout("/dev/mapper/luks-sda2 / ext4 rw 0 1\n")),
    );

    let mut plan = InstallPlan::new(luks_root_layout(Firmware::UEFI64));
    plan.bootloader_config.bootloader = Bootloader::Systemd;
    plan.hostname = "vault".into();

    let report = perform_installation(rig.host(), target.path(), &plan, OFFLINE).unwrap();
    assert!(report.is_complete(), "missing {:?}", report.missing_steps());
    assert_eq!(report.bootloader, Some(Bootloader::Systemd));
    // the root container is opened by the initramfs, not a keyfile
    assert!(report.keyfiles.keyfiles.is_empty());

    let wipe = rig.runner.position("wipefs --all /dev/sda").unwrap();
    let encrypt = rig.runner.position("cryptsetup --batch-mode").unwrap();
    let mount_root = rig
        .runner
        .position(&format!("mount -t ext4 /dev/mapper/luks-sda2 {t}"))
        .unwrap();
    let mount_esp = rig.runner.position("mount -t vfat").unwrap();
    let fstab = rig.runner.position("genfstab").unwrap();
    assert!(wipe < encrypt && encrypt < mount_root && mount_root < mount_esp && mount_esp < fstab);

    let entry = fs::read_to_string(target.path().join("boot/loader/entries/arch_linux.conf")).unwrap();
    assert!(entry.contains("options rd.luks.name=5e1f-0001=root root=/dev/mapper/root rw rootfstype=ext4\n"));

    let mkinitcpio = fs::read_to_string(target.path().join("etc/mkinitcpio.conf")).unwrap();
    assert!(mkinitcpio.contains("sd-encrypt filesystems"));
    assert_eq!(fs::read_to_string(target.path().join("etc/hostname")).unwrap(), "vault\n");

    let installed = rig.packages.installed();
    for package in ["base", "linux", "dosfstools", "efibootmgr"] {
        assert!(installed.contains(&package.to_string()), "{package} not installed");
    }

    // the session leaves the target mounted; teardown is asked for separately
    assert_eq!(rig.runner.count("umount"), 0);
    let torn = teardown(&rig.host(), target.path(), &plan.disk_config);
    assert!(torn.unmounted);
    assert_eq!(torn.closed, vec!["luks-sda2"]);
}

#[test]
fn uefi_only_loader_on_bios_touches_nothing() {
    let target = strapped_target();
    let rig = Rig::new(Firmware::BIOS, ScriptedRunner::new());

    for bootloader in [Bootloader::Refind, Bootloader::Efistub] {
        let mut plan = InstallPlan::new(luks_root_layout(Firmware::BIOS));
        plan.bootloader_config.bootloader = bootloader;

        let err = perform_installation(rig.host(), target.path(), &plan, OFFLINE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Hardware);
    }
    assert!(rig.runner.rendered().is_empty());
    assert!(rig.packages.installed().is_empty());
    assert!(!target.path().join("boot").exists());
}

#[test]
fn failed_partitioning_stops_before_encryption() {
    let target = strapped_target();
    let rig = Rig::new(
        Firmware::UEFI64,
        ScriptedRunner::new().fail("sfdisk", 1, "device is busy"),
    );
    let mut plan = InstallPlan::new(luks_root_layout(Firmware::UEFI64));
    plan.bootloader_config.bootloader = Bootloader::Systemd;

    let err = perform_installation(rig.host(), target.path(), &plan, OFFLINE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disk);
    assert_eq!(rig.runner.count("cryptsetup"), 0);
    assert!(rig.packages.installed().is_empty());
}

#[test]
fn encrypted_esp_is_refused_before_partitioning() {
    let target = strapped_target();
    let rig = Rig::new(Firmware::UEFI64, ScriptedRunner::new());
    let mut layout = luks_root_layout(Firmware::UEFI64);
    let everything: Vec<_> = layout.partitions().map(|p| p.obj_id).collect();
    layout.disk_encryption = Some(
        DiskEncryption::new(EncryptionType::Luks, Some(Password::new("hunter2")), everything, []).unwrap(),
    );
    let mut plan = InstallPlan::new(layout);
    plan.bootloader_config.bootloader = Bootloader::Systemd;

    let err = perform_installation(rig.host(), target.path(), &plan, OFFLINE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(rig.runner.rendered().is_empty());
}
