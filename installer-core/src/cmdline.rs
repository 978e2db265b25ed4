// SPDX-License-Identifier: GPL-3.0-only

//! Kernel command line synthesis
//!
//! Resolving the root touches the host (LUKS header UUIDs, LVM segment
//! lookups); turning a resolved root into parameters is pure.

use std::path::PathBuf;

use installer_sys::{Luks2, lvm};
use installer_types::{
    DiskLayoutConfiguration, EncryptionType, FilesystemType, PartitionModification, RootElement,
};
use tracing::{debug, warn};

use crate::error::{InstallError, Result};
use crate::host::Host;

/// Mapper name the initramfs opens an encrypted root as
pub const ROOT_MAPPER: &str = "root";

/// Mapper name of the LUKS container holding the LVM physical volume
pub const LVM_MAPPER: &str = "cryptlvm";

/// How the root block device is reached at boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSpec {
    /// A LUKS partition opened as `root`
    EncryptedPartition { luks_uuid: String },
    Partition {
        partuuid: Option<String>,
        uuid: Option<String>,
        dev_path: PathBuf,
    },
    /// A logical volume inside a VG whose PV is a LUKS container
    LvmOnLuks { luks_uuid: String, lv_path: PathBuf },
    /// A LUKS-formatted logical volume opened as `root`
    LuksOnLvm { luks_uuid: String },
    Lvm { lv_path: PathBuf },
    Zfs { dataset: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoot {
    pub spec: RootSpec,
    pub fs_type: Option<FilesystemType>,
    pub subvolume: Option<String>,
}

/// How an unencrypted root partition is named on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RootIdentity {
    #[default]
    PartUuid,
    Uuid,
    /// Leave `root=` to the consumer, as GRUB's generator does
    Omit,
}

fn luks_uuid(host: &Host<'_>, dev: impl Into<PathBuf>) -> Result<String> {
    let dev = dev.into();
    let uuid = Luks2::new(host.runner, dev.clone(), "", None).uuid()?;
    if uuid.is_empty() {
        return Err(InstallError::Disk(format!(
            "could not read the LUKS UUID of {}",
            dev.display()
        )));
    }
    Ok(uuid)
}

/// Find the encrypted partition whose mapper device backs `pv`
fn partition_behind_pv<'a>(
    layout: &'a DiskLayoutConfiguration,
    pv: &std::path::Path,
) -> Option<&'a PartitionModification> {
    let pv_name = pv.file_name()?.to_string_lossy().into_owned();
    let encryption = layout.encryption();
    layout
        .partitions()
        .filter(|p| encryption.contains(&p.obj_id))
        .find(|p| p.mapper_name().is_ok_and(|m| m == pv_name))
}

/// Work out how the root is reached once the layout is applied and mounted
pub fn resolve_root(host: &Host<'_>, layout: &DiskLayoutConfiguration) -> Result<ResolvedRoot> {
    let root = layout
        .root()
        .ok_or_else(|| InstallError::Configuration("the layout has no root".into()))?;
    let encryption = layout.encryption();
    let subvolume = root
        .root_subvolume()
        .map(|s| s.display().to_string());

    let spec = match root {
        RootElement::Dataset { pool, dataset } => RootSpec::Zfs {
            dataset: pool.full_name(dataset),
        },
        RootElement::Partition(part) => {
            if encryption.contains(&part.obj_id) {
                RootSpec::EncryptedPartition {
                    luks_uuid: luks_uuid(host, part.safe_dev_path()?)?,
                }
            } else {
                RootSpec::Partition {
                    partuuid: part.partuuid.clone(),
                    uuid: part.uuid.clone(),
                    dev_path: part.safe_dev_path()?.to_path_buf(),
                }
            }
        }
        RootElement::Volume(volume) => match encryption.encryption_type() {
            EncryptionType::LvmOnLuks => {
                let vg = volume.vg_name.as_deref().unwrap_or_default();
                let pv = lvm::pv_of_volume(host.runner, vg, &volume.name)?;
                debug!("Root volume {vg}/{} lives on {}", volume.name, pv.display());
                let part = partition_behind_pv(layout, &pv).ok_or_else(|| {
                    InstallError::Disk(format!(
                        "no encrypted partition backs physical volume {}",
                        pv.display()
                    ))
                })?;
                RootSpec::LvmOnLuks {
                    luks_uuid: luks_uuid(host, part.safe_dev_path()?)?,
                    lv_path: volume.dm_path()?,
                }
            }
            EncryptionType::LuksOnLvm if encryption.contains(&volume.obj_id) => {
                RootSpec::LuksOnLvm {
                    luks_uuid: luks_uuid(host, volume.safe_dev_path()?)?,
                }
            }
            _ => RootSpec::Lvm {
                lv_path: volume.dm_path()?,
            },
        },
    };

    Ok(ResolvedRoot {
        spec,
        fs_type: root.fs_type(),
        subvolume,
    })
}

/// Parameters identifying and mounting the root, followed by `extra`
pub fn kernel_params(
    root: &ResolvedRoot,
    identity: RootIdentity,
    zram: bool,
    extra: &[String],
) -> Vec<String> {
    let omit = identity == RootIdentity::Omit;
    let mut params = Vec::new();

    match &root.spec {
        RootSpec::EncryptedPartition { luks_uuid } => {
            params.push(format!("rd.luks.name={luks_uuid}={ROOT_MAPPER}"));
            if !omit {
                params.push(format!("root=/dev/mapper/{ROOT_MAPPER}"));
            }
        }
        RootSpec::Partition {
            partuuid,
            uuid,
            dev_path,
        } => match identity {
            RootIdentity::Omit => {}
            RootIdentity::PartUuid if partuuid.is_some() => {
                params.push(format!("root=PARTUUID={}", partuuid.as_deref().unwrap_or_default()));
            }
            _ => match uuid {
                Some(uuid) => params.push(format!("root=UUID={uuid}")),
                None => {
                    warn!(
                        "Root {} has no PARTUUID or UUID, using the device path",
                        dev_path.display()
                    );
                    params.push(format!("root={}", dev_path.display()));
                }
            },
        },
        RootSpec::LvmOnLuks { luks_uuid, lv_path } => {
            params.push(format!("rd.luks.name={luks_uuid}={LVM_MAPPER}"));
            params.push(format!("root={}", lv_path.display()));
        }
        RootSpec::LuksOnLvm { luks_uuid } => {
            params.push(format!("rd.luks.name={luks_uuid}={ROOT_MAPPER}"));
            params.push(format!("root=/dev/mapper/{ROOT_MAPPER}"));
        }
        RootSpec::Lvm { lv_path } => params.push(format!("root={}", lv_path.display())),
        RootSpec::Zfs { dataset } => params.push(format!("root=ZFS={dataset}")),
    }

    if zram {
        params.push("zswap.enabled=0".into());
    }

    if !omit {
        if let Some(subvol) = &root.subvolume {
            params.push(format!("rootflags=subvol={subvol}"));
        }
        params.push("rw".into());
    }

    match (&root.spec, root.fs_type) {
        (RootSpec::Zfs { .. }, _) => params.push("rootfstype=zfs".into()),
        (_, Some(fs)) => params.push(format!("rootfstype={}", fs.mount_type())),
        (_, None) => {}
    }

    params.extend(extra.iter().cloned());
    params
}
