// SPDX-License-Identifier: GPL-3.0-only

//! The complete disk layout handed from the planner to the installer

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{
    DeviceModification, FilesystemType, ModificationStatus, PartitionModification,
    SubvolumeModification,
};
use crate::encryption::DiskEncryption;
use crate::error::{LayoutError, Result};
use crate::lvm::{LvmConfiguration, LvmVolume};
use crate::zfs::{ZfsConfiguration, ZfsDatasetConfig, ZfsPool};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskLayoutType {
    /// Suggested by the planner
    #[default]
    Default,

    /// Edited partition by partition
    Manual,

    /// Already partitioned and mounted by the user at `mountpoint`
    PreMount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayoutConfiguration {
    #[serde(default)]
    pub config_type: DiskLayoutType,

    #[serde(default)]
    pub device_modifications: Vec<DeviceModification>,

    #[serde(default)]
    pub lvm_config: Option<LvmConfiguration>,

    #[serde(default)]
    pub zfs_config: Option<ZfsConfiguration>,

    #[serde(default)]
    pub disk_encryption: Option<DiskEncryption>,

    /// Existing root for pre-mounted layouts
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
}

/// The element that ends up mounted at `/`
#[derive(Debug, Clone, Copy)]
pub enum RootElement<'a> {
    Partition(&'a PartitionModification),
    Volume(&'a LvmVolume),
    Dataset {
        pool: &'a ZfsPool,
        dataset: &'a ZfsDatasetConfig,
    },
}

impl RootElement<'_> {
    pub fn obj_id(&self) -> Option<Uuid> {
        match self {
            Self::Partition(p) => Some(p.obj_id),
            Self::Volume(v) => Some(v.obj_id),
            Self::Dataset { .. } => None,
        }
    }

    pub fn fs_type(&self) -> Option<FilesystemType> {
        match self {
            Self::Partition(p) => p.fs_type,
            Self::Volume(v) => Some(v.fs_type),
            Self::Dataset { .. } => None,
        }
    }

    pub fn subvolumes(&self) -> &[SubvolumeModification] {
        match self {
            Self::Partition(p) => &p.btrfs_subvols,
            Self::Volume(v) => &v.btrfs_subvols,
            Self::Dataset { .. } => &[],
        }
    }

    /// Subvolume mounted at `/`, if the root is a btrfs subvolume
    pub fn root_subvolume(&self) -> Option<&Path> {
        self.subvolumes()
            .iter()
            .find(|s| s.is_root())
            .map(|s| s.name.as_path())
    }
}

impl DiskLayoutConfiguration {
    pub fn new(config_type: DiskLayoutType, device_modifications: Vec<DeviceModification>) -> Self {
        Self {
            config_type,
            device_modifications,
            lvm_config: None,
            zfs_config: None,
            disk_encryption: None,
            mountpoint: None,
        }
    }

    pub fn pre_mount(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: Some(mountpoint.into()),
            ..Self::new(DiskLayoutType::PreMount, Vec::new())
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionModification> {
        self.device_modifications
            .iter()
            .flat_map(|m| m.partitions.iter())
    }

    pub fn partition(&self, obj_id: &Uuid) -> Option<&PartitionModification> {
        self.partitions().find(|p| p.obj_id == *obj_id)
    }

    /// Device modification that owns the partition
    pub fn device_of(&self, obj_id: &Uuid) -> Option<&DeviceModification> {
        self.device_modifications
            .iter()
            .find(|m| m.partitions.iter().any(|p| p.obj_id == *obj_id))
    }

    pub fn efi_partition(&self) -> Option<&PartitionModification> {
        self.device_modifications
            .iter()
            .find_map(DeviceModification::efi_partition)
    }

    pub fn boot_partition(&self) -> Option<&PartitionModification> {
        self.device_modifications
            .iter()
            .find_map(DeviceModification::boot_partition)
    }

    pub fn encryption(&self) -> DiskEncryption {
        self.disk_encryption.clone().unwrap_or_default()
    }

    /// Whether the partition is a physical volume or ZFS vdev rather than a
    /// mountable filesystem
    pub fn is_container_member(&self, obj_id: &Uuid) -> bool {
        self.lvm_config.as_ref().is_some_and(|lvm| lvm.is_pv(obj_id))
            || self
                .zfs_config
                .as_ref()
                .is_some_and(|zfs| zfs.pool.pvs.contains(obj_id))
    }

    /// Resolve the root element: ZFS dataset, then LVM volume, then partition
    pub fn root(&self) -> Option<RootElement<'_>> {
        if let Some(zfs) = &self.zfs_config
            && let Some(dataset) = zfs.pool.root_dataset()
        {
            return Some(RootElement::Dataset {
                pool: &zfs.pool,
                dataset,
            });
        }

        if let Some(lvm) = &self.lvm_config
            && let Some(volume) = lvm.root_volume()
        {
            return Some(RootElement::Volume(volume));
        }

        self.partitions()
            .find(|p| p.is_root())
            .map(RootElement::Partition)
    }

    /// Per-device role uniqueness and an unencrypted ESP
    ///
    /// Partitions marked for deletion are ignored.
    pub fn validate(&self) -> Result<()> {
        for modification in &self.device_modifications {
            let kept: Vec<&PartitionModification> = modification
                .partitions
                .iter()
                .filter(|p| p.status != ModificationStatus::Delete)
                .collect();
            let roles: [(&'static str, fn(&PartitionModification) -> bool); 3] = [
                ("EFI system", PartitionModification::is_efi),
                ("boot", PartitionModification::is_boot),
                ("root", PartitionModification::is_root),
            ];
            for (role, has_role) in roles {
                let count = kept
                    .iter()
                    .copied()
                    .filter(|p| has_role(p) && !self.is_container_member(&p.obj_id))
                    .count();
                if count > 1 {
                    return Err(LayoutError::DuplicateRole {
                        device: modification.device.path.clone(),
                        role,
                        count,
                    });
                }
            }
        }

        let encryption = self.encryption();
        if let Some(esp) = self
            .partitions()
            .find(|p| p.is_efi() && encryption.partitions().contains(&p.obj_id))
        {
            return Err(LayoutError::EncryptedEsp(esp.describe()));
        }
        Ok(())
    }

    /// Every filesystem type that will exist on the target
    pub fn filesystems(&self) -> Vec<FilesystemType> {
        let mut types: Vec<FilesystemType> = self.partitions().filter_map(|p| p.fs_type).collect();
        if let Some(lvm) = &self.lvm_config {
            types.extend(lvm.volumes().map(|v| v.fs_type));
        }
        types.sort_by_key(|t| t.as_str());
        types.dedup();
        types
    }
}
