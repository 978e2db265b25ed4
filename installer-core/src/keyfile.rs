// SPDX-License-Identifier: GPL-3.0-only

//! Keyfiles for encrypted elements
//!
//! Non-root containers get a keyfile plus a crypttab line so systemd opens
//! them once root is up. The root container only gets one when
//! `auto_unlock_root` is set; its path goes into the initramfs `FILES` so
//! sd-encrypt finds it under `/etc/cryptsetup-keys.d/`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use installer_sys::{CommandRunner, KeySlotCost, Luks2};
use installer_types::{DiskEncryption, DiskLayoutConfiguration, EncryptionType};
use tracing::{debug, info};

use crate::cmdline::{LVM_MAPPER, ROOT_MAPPER};
use crate::error::{InstallError, Result};
use crate::initramfs::Initramfs;

const CRYPTTAB: &str = "etc/crypttab";

/// Keyfiles created by one pass, as paths inside the target
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyfileReport {
    pub keyfiles: Vec<PathBuf>,
    pub crypttab: Vec<String>,
}

/// One encrypted element the pass looks at
struct Candidate<'a> {
    dev_path: PathBuf,
    mapper: String,
    is_root: bool,
    is_boot: bool,
    obj_id: &'a uuid::Uuid,
}

pub fn generate_key_files(
    runner: &dyn CommandRunner,
    target: &Path,
    layout: &DiskLayoutConfiguration,
    initramfs: &mut Initramfs,
) -> Result<KeyfileReport> {
    let encryption = layout.encryption();
    let mut report = KeyfileReport::default();

    match encryption.encryption_type() {
        EncryptionType::NoEncryption => {}
        EncryptionType::Luks => {
            let mut candidates = Vec::new();
            for part in layout
                .partitions()
                .filter(|p| encryption.partitions().contains(&p.obj_id))
            {
                candidates.push(Candidate {
                    dev_path: part.safe_dev_path()?.to_path_buf(),
                    mapper: part.mapper_name()?,
                    is_root: part.is_root(),
                    is_boot: part.is_boot(),
                    obj_id: &part.obj_id,
                });
            }
            generate_for(runner, target, &encryption, candidates, initramfs, &mut report)?;
        }
        EncryptionType::LuksOnLvm => {
            let mut candidates = Vec::new();
            if let Some(lvm) = &layout.lvm_config {
                for volume in lvm
                    .volumes()
                    .filter(|v| encryption.lvm_volumes().contains(&v.obj_id))
                {
                    candidates.push(Candidate {
                        dev_path: volume.safe_dev_path()?,
                        mapper: volume.mapper_name()?,
                        is_root: volume.is_root(),
                        is_boot: false,
                        obj_id: &volume.obj_id,
                    });
                }
            }
            generate_for(runner, target, &encryption, candidates, initramfs, &mut report)?;
        }
        EncryptionType::LvmOnLuks => {
            // the container holds the PV rather than root itself
            if encryption.auto_unlock_root()
                && let Some(part) = layout.partitions().find(|p| {
                    encryption.partitions().contains(&p.obj_id) && !p.is_boot() && !p.is_efi()
                })
            {
                let handle = Luks2::new(
                    runner,
                    part.safe_dev_path()?,
                    part.mapper_name()?,
                    encryption.password().cloned(),
                );
                let path = root_keyfile(&handle, target, LVM_MAPPER, initramfs)?;
                report.keyfiles.push(path);
            }
        }
    }

    if !report.crypttab.is_empty() {
        append_crypttab(target, &report.crypttab)?;
    }
    Ok(report)
}

fn generate_for(
    runner: &dyn CommandRunner,
    target: &Path,
    encryption: &DiskEncryption,
    candidates: Vec<Candidate<'_>>,
    initramfs: &mut Initramfs,
    report: &mut KeyfileReport,
) -> Result<()> {
    for candidate in candidates {
        let handle = Luks2::new(
            runner,
            candidate.dev_path.clone(),
            candidate.mapper.clone(),
            encryption.password().cloned(),
        );

        if encryption.should_generate_encryption_file(candidate.obj_id, candidate.is_root) {
            debug!("Creating keyfile for {}", candidate.dev_path.display());
            let cost = if candidate.is_boot {
                KeySlotCost::for_grub(encryption.pbkdf())
            } else {
                KeySlotCost::default()
            };
            let path = handle.create_keyfile(target, &candidate.mapper, cost)?;

            let luks_uuid = handle.uuid()?;
            if luks_uuid.is_empty() {
                return Err(InstallError::Disk(format!(
                    "could not read the LUKS UUID of {}",
                    candidate.dev_path.display()
                )));
            }
            report.crypttab.push(crypttab_line(&candidate.mapper, &luks_uuid, &path));
            report.keyfiles.push(path);
        }

        if candidate.is_root && encryption.auto_unlock_root() {
            let path = root_keyfile(&handle, target, ROOT_MAPPER, initramfs)?;
            report.keyfiles.push(path);
        }
    }
    Ok(())
}

fn root_keyfile(
    handle: &Luks2<'_>,
    target: &Path,
    name: &str,
    initramfs: &mut Initramfs,
) -> Result<PathBuf> {
    info!("Creating auto-unlock keyfile for {}", handle.luks_dev_path().display());
    let path = handle.create_keyfile(target, name, KeySlotCost::default())?;
    initramfs.add_file(path.display().to_string());
    Ok(path)
}

pub fn crypttab_line(mapper: &str, luks_uuid: &str, keyfile: &Path) -> String {
    format!(
        "{mapper} UUID={luks_uuid} {} luks,key-slot=1",
        keyfile.display()
    )
}

fn append_crypttab(target: &Path, lines: &[String]) -> Result<()> {
    let path = target.join(CRYPTTAB);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use installer_sys::CommandOutput;
    use installer_sys::testing::ScriptedRunner;
    use installer_types::{
        BlockDevice, DeviceModification, DiskLayoutType, FilesystemType, PartitionModification,
        PartitionTable, Password, SectorSize, Size,
    };

    use super::*;

    fn layout(encrypt_home: bool, auto_unlock: bool) -> DiskLayoutConfiguration {
        let ss = SectorSize::default();
        let disk = BlockDevice {
            path: PathBuf::from("/dev/sda"),
            model: None,
            total_size: Size::gib(100, ss),
            sector_size: ss,
            partitions: Vec::new(),
        };
        let mut dev = DeviceModification::new(disk, true, PartitionTable::Gpt);
        let mut root = PartitionModification::create(Size::gib(1, ss), Size::gib(40, ss), Some(FilesystemType::Ext4))
            .with_mountpoint("/");
        root.dev_path = Some("/dev/sda2".into());
        let mut home = PartitionModification::create(Size::gib(41, ss), Size::gib(50, ss), Some(FilesystemType::Ext4))
            .with_mountpoint("/home");
        home.dev_path = Some("/dev/sda3".into());

        let mut ids = vec![root.obj_id];
        if encrypt_home {
            ids.push(home.obj_id);
        }
        dev.add_partition(root);
        dev.add_partition(home);

        let mut layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dev]);
        layout.disk_encryption = Some(
            DiskEncryption::new(EncryptionType::Luks, Some(Password::new("pw")), ids, [])
                .unwrap()
                .with_auto_unlock_root(auto_unlock),
        );
        layout
    }

    #[test]
    fn non_root_container_gets_keyfile_and_crypttab() {
        let target = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new().respond(
            "cryptsetup luksUUID /dev/sda3",
            CommandOutput::stdout("5e1c-home\n"),
        );
        let mut initramfs = Initramfs::default();

        let report =
            generate_key_files(&runner, target.path(), &layout(true, false), &mut initramfs)
                .unwrap();
        assert_eq!(
            report.keyfiles,
            vec![PathBuf::from("/etc/cryptsetup-keys.d/luks-sda3.key")]
        );
        let crypttab = fs::read_to_string(target.path().join("etc/crypttab")).unwrap();
        assert_eq!(
            crypttab,
            "luks-sda3 UUID=5e1c-home /etc/cryptsetup-keys.d/luks-sda3.key luks,key-slot=1\n"
        );
        assert!(initramfs.files.is_empty());
        assert_eq!(runner.count("cryptsetup luksAddKey"), 1);
    }

    #[test]
    fn root_auto_unlock_adds_initramfs_file() {
        let target = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .respond_once(
                "cryptsetup luksDump /dev/sda2",
                CommandOutput::stdout("Keyslots:\n  0: luks2\nTokens:\n"),
            )
            .respond(
                "cryptsetup luksDump /dev/sda2",
                CommandOutput::stdout("Keyslots:\n  0: luks2\n  1: luks2\nTokens:\n"),
            );
        let mut initramfs = Initramfs::default();
        let root = Luks2::new(&runner, "/dev/sda2", ROOT_MAPPER, None);
        let slots_before = root.key_slot_count().unwrap();

        let report =
            generate_key_files(&runner, target.path(), &layout(false, true), &mut initramfs)
                .unwrap();
        assert_eq!(
            report.keyfiles,
            vec![PathBuf::from("/etc/cryptsetup-keys.d/root.key")]
        );
        assert_eq!(initramfs.files, vec!["/etc/cryptsetup-keys.d/root.key"]);

        let key = target.path().join("etc/cryptsetup-keys.d/root.key");
        assert_eq!(fs::metadata(&key).unwrap().permissions().mode() & 0o777, 0);
        assert!(!target.path().join("etc/crypttab").exists());
        assert_eq!(runner.count("cryptsetup luksAddKey"), 1);
        assert_eq!(root.key_slot_count().unwrap(), slots_before + 1);
    }

    #[test]
    fn nothing_for_root_without_auto_unlock() {
        let target = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let mut initramfs = Initramfs::default();

        let report =
            generate_key_files(&runner, target.path(), &layout(false, false), &mut initramfs)
                .unwrap();
        assert!(report.keyfiles.is_empty());
        assert!(runner.calls().is_empty());
        assert!(!target.path().join("etc/cryptsetup-keys.d").exists());
    }
}
