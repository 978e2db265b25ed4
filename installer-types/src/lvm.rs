// SPDX-License-Identifier: GPL-3.0-only

//! LVM (Logical Volume Manager) plan types
//!
//! Physical volumes are referenced by the object id of the partition that
//! backs them; the partition itself stays owned by its `DeviceModification`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{FilesystemType, SubvolumeModification, strip_root};
use crate::error::{LayoutError, Result};
use crate::size::Size;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LvmLayoutType {
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LvmVolumeStatus {
    Exist,
    Modify,
    Delete,
    #[default]
    Create,
}

/// A logical volume in the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmVolume {
    #[serde(default = "Uuid::new_v4")]
    pub obj_id: Uuid,

    #[serde(default)]
    pub status: LvmVolumeStatus,

    /// Logical volume name
    pub name: String,

    pub fs_type: FilesystemType,

    pub length: Size,

    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    #[serde(default)]
    pub mount_options: Vec<String>,

    #[serde(default)]
    pub btrfs_subvols: Vec<SubvolumeModification>,

    /// Owning volume group, set when the volume is added to a group
    #[serde(default)]
    pub vg_name: Option<String>,

    /// Filesystem UUID, resolved after formatting
    #[serde(default)]
    pub uuid: Option<String>,
}

impl LvmVolume {
    pub fn new(name: impl Into<String>, fs_type: FilesystemType, length: Size) -> Self {
        Self {
            obj_id: Uuid::new_v4(),
            status: LvmVolumeStatus::Create,
            name: name.into(),
            fs_type,
            length,
            mountpoint: None,
            mount_options: Vec::new(),
            btrfs_subvols: Vec::new(),
            vg_name: None,
            uuid: None,
        }
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn with_mount_options(mut self, options: Vec<String>) -> Self {
        self.mount_options = options;
        self
    }

    pub fn with_subvolumes(mut self, subvols: Vec<SubvolumeModification>) -> Self {
        self.btrfs_subvols = subvols;
        self
    }

    pub fn is_root(&self) -> bool {
        self.mountpoint.as_deref() == Some(Path::new("/"))
            || self.btrfs_subvols.iter().any(SubvolumeModification::is_root)
    }

    pub fn is_swap(&self) -> bool {
        self.fs_type.is_swap()
    }

    pub fn relative_mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref().map(strip_root)
    }

    fn safe_vg_name(&self) -> Result<&str> {
        self.vg_name
            .as_deref()
            .ok_or_else(|| LayoutError::Invalid(format!("volume {} has no volume group", self.name)))
    }

    /// `/dev/<vg>/<lv>`
    pub fn safe_dev_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/dev").join(self.safe_vg_name()?).join(&self.name))
    }

    /// `/dev/mapper/<vg>-<lv>`, with dashes escaped the way device-mapper does
    pub fn dm_path(&self) -> Result<PathBuf> {
        let vg = self.safe_vg_name()?.replace('-', "--");
        let lv = self.name.replace('-', "--");
        Ok(PathBuf::from("/dev/mapper").join(format!("{vg}-{lv}")))
    }

    /// Device-mapper name used when the volume is opened as a LUKS container
    pub fn mapper_name(&self) -> Result<String> {
        Ok(format!("luks-{}-{}", self.safe_vg_name()?, self.name))
    }
}

/// A volume group built from planned partitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmVolumeGroup {
    pub name: String,

    /// Object ids of the partitions used as physical volumes
    pub pvs: Vec<Uuid>,

    #[serde(default)]
    pub volumes: Vec<LvmVolume>,
}

impl LvmVolumeGroup {
    pub fn new(name: impl Into<String>, pvs: Vec<Uuid>) -> Self {
        Self {
            name: name.into(),
            pvs,
            volumes: Vec::new(),
        }
    }

    pub fn add_volume(&mut self, mut volume: LvmVolume) {
        volume.vg_name = Some(self.name.clone());
        self.volumes.push(volume);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmConfiguration {
    #[serde(default)]
    pub config_type: LvmLayoutType,

    pub vol_groups: Vec<LvmVolumeGroup>,
}

impl LvmConfiguration {
    /// Object ids of every partition used as a physical volume
    pub fn all_pvs(&self) -> impl Iterator<Item = &Uuid> {
        self.vol_groups.iter().flat_map(|vg| vg.pvs.iter())
    }

    pub fn is_pv(&self, partition: &Uuid) -> bool {
        self.all_pvs().any(|id| id == partition)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &LvmVolume> {
        self.vol_groups.iter().flat_map(|vg| vg.volumes.iter())
    }

    pub fn root_volume(&self) -> Option<&LvmVolume> {
        self.volumes().find(|vol| vol.is_root())
    }

    pub fn volume(&self, obj_id: &Uuid) -> Option<&LvmVolume> {
        self.volumes().find(|vol| vol.obj_id == *obj_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::SectorSize;

    #[test]
    fn volumes_inherit_group_name() {
        let mut vg = LvmVolumeGroup::new("ArchVg", vec![Uuid::new_v4()]);
        vg.add_volume(
            LvmVolume::new("root", FilesystemType::Ext4, Size::gib(20, SectorSize::default()))
                .with_mountpoint("/"),
        );
        let vol = &vg.volumes[0];
        assert_eq!(vol.vg_name.as_deref(), Some("ArchVg"));
        assert_eq!(
            vol.safe_dev_path().unwrap(),
            PathBuf::from("/dev/ArchVg/root")
        );
        assert_eq!(
            vol.dm_path().unwrap(),
            PathBuf::from("/dev/mapper/ArchVg-root")
        );
        assert_eq!(vol.mapper_name().unwrap(), "luks-ArchVg-root");
    }

    #[test]
    fn dm_path_escapes_dashes() {
        let mut vg = LvmVolumeGroup::new("my-vg", Vec::new());
        vg.add_volume(LvmVolume::new(
            "data-lv",
            FilesystemType::Xfs,
            Size::gib(1, SectorSize::default()),
        ));
        assert_eq!(
            vg.volumes[0].dm_path().unwrap(),
            PathBuf::from("/dev/mapper/my--vg-data--lv")
        );
    }

    #[test]
    fn root_volume_lookup() {
        let pv = Uuid::new_v4();
        let mut vg = LvmVolumeGroup::new("vg", vec![pv]);
        vg.add_volume(LvmVolume::new(
            "home",
            FilesystemType::Ext4,
            Size::gib(5, SectorSize::default()),
        ));
        vg.add_volume(
            LvmVolume::new("root", FilesystemType::Btrfs, Size::gib(5, SectorSize::default()))
                .with_subvolumes(vec![SubvolumeModification::new("@", Some("/"))]),
        );
        let config = LvmConfiguration {
            config_type: LvmLayoutType::Default,
            vol_groups: vec![vg],
        };
        assert_eq!(config.root_volume().map(|v| v.name.as_str()), Some("root"));
        assert!(config.is_pv(&pv));
        assert!(!config.is_pv(&Uuid::new_v4()));
    }
}
