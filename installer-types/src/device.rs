// SPDX-License-Identifier: GPL-3.0-only

//! Block devices and the partition plan applied to them

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LayoutError, Result};
use crate::size::{SectorSize, Size};

/// Partition table type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    /// GPT (GUID Partition Table)
    #[default]
    Gpt,

    /// MBR/DOS (Master Boot Record)
    Mbr,
}

impl PartitionTable {
    pub fn is_gpt(self) -> bool {
        matches!(self, Self::Gpt)
    }

    /// Label name understood by sfdisk
    pub fn as_sfdisk_label(self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Mbr => "dos",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gpt" => Some(Self::Gpt),
            "dos" | "mbr" | "msdos" => Some(Self::Mbr),
            _ => None,
        }
    }
}

/// What the applier does with a planned element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModificationStatus {
    /// Already on disk, left untouched
    Exist,

    /// Already on disk, reformatted
    Modify,

    /// Removed from the disk
    Delete,

    /// Created by the applier
    #[default]
    Create,
}

impl ModificationStatus {
    pub fn exists(self) -> bool {
        matches!(self, Self::Exist)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    #[default]
    Primary,
    Boot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFlag {
    /// Legacy boot partition
    Boot,

    /// EFI system partition
    Esp,

    /// Embedding area for GRUB on BIOS+GPT
    BiosGrub,

    /// GPT home partition type
    LinuxHome,
}

/// Filesystem types the installer can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Btrfs,
    Ext2,
    Ext3,
    Ext4,
    F2fs,
    Fat12,
    Fat16,
    Fat32,
    Ntfs,
    Xfs,
    #[serde(rename = "linux-swap")]
    LinuxSwap,
    #[serde(rename = "crypto_LUKS")]
    CryptoLuks,
}

impl FilesystemType {
    pub fn is_fat(self) -> bool {
        matches!(self, Self::Fat12 | Self::Fat16 | Self::Fat32)
    }

    pub fn is_swap(self) -> bool {
        matches!(self, Self::LinuxSwap)
    }

    /// Type passed to `mount -t`
    pub fn mount_type(self) -> &'static str {
        match self {
            Self::Btrfs => "btrfs",
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::F2fs => "f2fs",
            Self::Fat12 | Self::Fat16 | Self::Fat32 => "vfat",
            Self::Ntfs => "ntfs3",
            Self::Xfs => "xfs",
            Self::LinuxSwap => "swap",
            Self::CryptoLuks => "crypto_LUKS",
        }
    }

    /// Name used on the kernel command line (`rootfstype=`) and in lsblk output
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Btrfs => "btrfs",
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::F2fs => "f2fs",
            Self::Fat12 => "fat12",
            Self::Fat16 => "fat16",
            Self::Fat32 => "fat32",
            Self::Ntfs => "ntfs",
            Self::Xfs => "xfs",
            Self::LinuxSwap => "linux-swap",
            Self::CryptoLuks => "crypto_LUKS",
        }
    }

    /// Parse the FSTYPE column of lsblk
    pub fn from_lsblk(s: &str) -> Option<Self> {
        match s {
            "btrfs" => Some(Self::Btrfs),
            "ext2" => Some(Self::Ext2),
            "ext3" => Some(Self::Ext3),
            "ext4" => Some(Self::Ext4),
            "f2fs" => Some(Self::F2fs),
            "vfat" | "fat32" => Some(Self::Fat32),
            "fat16" => Some(Self::Fat16),
            "fat12" => Some(Self::Fat12),
            "ntfs" | "ntfs3" => Some(Self::Ntfs),
            "xfs" => Some(Self::Xfs),
            "swap" | "linux-swap" => Some(Self::LinuxSwap),
            "crypto_LUKS" => Some(Self::CryptoLuks),
            _ => None,
        }
    }

    /// Package providing userspace tools for this filesystem on the target
    pub fn installation_package(self) -> Option<&'static str> {
        match self {
            Self::Btrfs => Some("btrfs-progs"),
            Self::Xfs => Some("xfsprogs"),
            Self::F2fs => Some("f2fs-tools"),
            Self::Fat12 | Self::Fat16 | Self::Fat32 => Some("dosfstools"),
            Self::Ntfs => Some("ntfs-3g"),
            _ => None,
        }
    }

    /// mkinitcpio module required to mount a root on this filesystem
    pub fn initramfs_module(self) -> Option<&'static str> {
        match self {
            Self::Btrfs => Some("btrfs"),
            Self::Xfs => Some("xfs"),
            Self::F2fs => Some("f2fs"),
            _ => None,
        }
    }
}

/// A btrfs subvolume created on a partition or logical volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeModification {
    /// Subvolume path relative to the filesystem root (e.g. `@home`)
    pub name: PathBuf,

    /// Where it is mounted inside the target, if anywhere
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
}

impl SubvolumeModification {
    pub fn new(name: impl Into<PathBuf>, mountpoint: Option<&str>) -> Self {
        Self {
            name: name.into(),
            mountpoint: mountpoint.map(PathBuf::from),
        }
    }

    pub fn is_root(&self) -> bool {
        self.mountpoint.as_deref() == Some(Path::new("/"))
    }

    /// Mountpoint with the leading `/` removed, for joining onto the target
    pub fn relative_mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref().map(strip_root)
    }
}

/// Strip the leading `/` so the path can be joined under a target root
pub fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// A partition that already exists on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Device path (e.g. "/dev/sda1")
    pub path: PathBuf,

    /// Partition number (1-based)
    pub partn: Option<u32>,

    /// Offset from the start of the disk
    pub start: Size,

    /// Length of the partition
    pub length: Size,

    /// Detected filesystem
    #[serde(default)]
    pub fs_type: Option<FilesystemType>,

    #[serde(default)]
    pub partuuid: Option<String>,

    #[serde(default)]
    pub uuid: Option<String>,

    #[serde(default)]
    pub mountpoints: Vec<PathBuf>,
}

/// A whole disk as reported by device enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device path (e.g. "/dev/sda")
    pub path: PathBuf,

    /// Model string reported by the kernel
    #[serde(default)]
    pub model: Option<String>,

    /// Total size of the device
    pub total_size: Size,

    /// Logical sector size
    #[serde(default)]
    pub sector_size: SectorSize,

    /// Partitions already present
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
}

/// A partition in the plan
///
/// Fields after `btrfs_subvols` are resolved by the applier once the
/// partition exists on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionModification {
    /// Stable identity used to reference this partition across the plan
    #[serde(default = "Uuid::new_v4")]
    pub obj_id: Uuid,

    #[serde(default)]
    pub status: ModificationStatus,

    #[serde(default)]
    pub partition_type: PartitionType,

    /// Offset from the start of the device
    pub start: Size,

    pub length: Size,

    /// `None` leaves the partition unformatted (e.g. a ZFS vdev)
    #[serde(default)]
    pub fs_type: Option<FilesystemType>,

    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    #[serde(default)]
    pub mount_options: Vec<String>,

    #[serde(default)]
    pub flags: Vec<PartitionFlag>,

    #[serde(default)]
    pub btrfs_subvols: Vec<SubvolumeModification>,

    #[serde(default)]
    pub dev_path: Option<PathBuf>,

    #[serde(default)]
    pub partn: Option<u32>,

    #[serde(default)]
    pub partuuid: Option<String>,

    #[serde(default)]
    pub uuid: Option<String>,
}

impl PartitionModification {
    /// A new partition to be created by the applier
    pub fn create(start: Size, length: Size, fs_type: Option<FilesystemType>) -> Self {
        Self {
            obj_id: Uuid::new_v4(),
            status: ModificationStatus::Create,
            partition_type: PartitionType::Primary,
            start,
            length,
            fs_type,
            mountpoint: None,
            mount_options: Vec::new(),
            flags: Vec::new(),
            btrfs_subvols: Vec::new(),
            dev_path: None,
            partn: None,
            partuuid: None,
            uuid: None,
        }
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn with_flag(mut self, flag: PartitionFlag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
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

    /// End offset (exclusive)
    pub fn end(&self) -> Size {
        self.start + self.length
    }

    pub fn has_flag(&self, flag: PartitionFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_efi(&self) -> bool {
        self.has_flag(PartitionFlag::Esp)
    }

    pub fn is_boot(&self) -> bool {
        self.has_flag(PartitionFlag::Boot)
    }

    pub fn is_bios_grub(&self) -> bool {
        self.has_flag(PartitionFlag::BiosGrub)
    }

    /// Mounted at `/` directly or through a root subvolume
    pub fn is_root(&self) -> bool {
        self.mountpoint.as_deref() == Some(Path::new("/"))
            || self.btrfs_subvols.iter().any(SubvolumeModification::is_root)
    }

    pub fn is_home(&self) -> bool {
        self.mountpoint.as_deref() == Some(Path::new("/home"))
    }

    pub fn is_swap(&self) -> bool {
        self.fs_type.is_some_and(FilesystemType::is_swap)
    }

    pub fn relative_mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref().map(strip_root)
    }

    pub fn safe_dev_path(&self) -> Result<&Path> {
        self.dev_path
            .as_deref()
            .ok_or_else(|| LayoutError::MissingDevicePath(self.describe()))
    }

    pub fn safe_fs_type(&self) -> Result<FilesystemType> {
        self.fs_type
            .ok_or_else(|| LayoutError::MissingFilesystem(self.describe()))
    }

    /// Device-mapper name used when the partition is opened as a LUKS container
    pub fn mapper_name(&self) -> Result<String> {
        let dev_path = self.safe_dev_path()?;
        let name = dev_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LayoutError::MissingDevicePath(self.describe()))?;
        Ok(format!("luks-{name}"))
    }

    /// Human readable label for log and error messages
    pub fn describe(&self) -> String {
        match (&self.dev_path, &self.mountpoint) {
            (Some(dev), _) => dev.display().to_string(),
            (None, Some(mp)) => format!("partition for {}", mp.display()),
            (None, None) => format!("partition {}", self.obj_id),
        }
    }
}

/// The plan for one physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModification {
    pub device: BlockDevice,

    /// Write a fresh partition table before creating partitions
    pub wipe: bool,

    #[serde(default)]
    pub partition_table: PartitionTable,

    #[serde(default)]
    pub partitions: Vec<PartitionModification>,
}

impl DeviceModification {
    pub fn new(device: BlockDevice, wipe: bool, partition_table: PartitionTable) -> Self {
        Self {
            device,
            wipe,
            partition_table,
            partitions: Vec::new(),
        }
    }

    pub fn add_partition(&mut self, partition: PartitionModification) {
        self.partitions.push(partition);
    }

    pub fn efi_partition(&self) -> Option<&PartitionModification> {
        self.partitions.iter().find(|p| p.is_efi())
    }

    /// Partition flagged as a dedicated boot partition with a mountpoint
    pub fn boot_partition(&self) -> Option<&PartitionModification> {
        self.partitions
            .iter()
            .find(|p| p.is_boot() && p.mountpoint.is_some())
    }

    pub fn sector_size(&self) -> SectorSize {
        self.device.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ss() -> SectorSize {
        SectorSize::default()
    }

    #[test]
    fn root_detection_covers_subvolumes() {
        let plain = PartitionModification::create(Size::mib(1, ss()), Size::gib(10, ss()), None)
            .with_mountpoint("/");
        assert!(plain.is_root());

        let subvol = PartitionModification::create(
            Size::mib(1, ss()),
            Size::gib(10, ss()),
            Some(FilesystemType::Btrfs),
        )
        .with_subvolumes(vec![
            SubvolumeModification::new("@", Some("/")),
            SubvolumeModification::new("@home", Some("/home")),
        ]);
        assert!(subvol.is_root());
        assert!(subvol.mountpoint.is_none());
    }

    #[test]
    fn mapper_name_requires_resolved_device() {
        let mut part =
            PartitionModification::create(Size::mib(1, ss()), Size::gib(1, ss()), None);
        assert!(matches!(
            part.mapper_name(),
            Err(LayoutError::MissingDevicePath(_))
        ));

        part.dev_path = Some(PathBuf::from("/dev/nvme0n1p2"));
        assert_eq!(part.mapper_name().unwrap(), "luks-nvme0n1p2");
    }

    #[test]
    fn boot_partition_needs_mountpoint() {
        let disk = BlockDevice {
            path: PathBuf::from("/dev/sda"),
            model: None,
            total_size: Size::gib(64, ss()),
            sector_size: ss(),
            partitions: Vec::new(),
        };
        let mut dev = DeviceModification::new(disk, true, PartitionTable::Gpt);
        dev.add_partition(
            PartitionModification::create(Size::mib(1, ss()), Size::gib(1, ss()), None)
                .with_flag(PartitionFlag::Boot),
        );
        assert!(dev.boot_partition().is_none());

        dev.partitions[0].mountpoint = Some(PathBuf::from("/boot"));
        assert!(dev.boot_partition().is_some());
    }

    #[test]
    fn lsblk_fstypes_map_to_filesystems() {
        assert_eq!(FilesystemType::from_lsblk("vfat"), Some(FilesystemType::Fat32));
        assert_eq!(FilesystemType::from_lsblk("swap"), Some(FilesystemType::LinuxSwap));
        assert_eq!(FilesystemType::from_lsblk("zfs_member"), None);
        assert_eq!(FilesystemType::Fat32.mount_type(), "vfat");
    }
}
