// SPDX-License-Identifier: GPL-3.0-only

//! Block device enumeration through `lsblk`

use std::path::{Path, PathBuf};

use installer_types::{BlockDevice, FilesystemType, PartitionInfo, SectorSize, Size};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::command::{Cmd, CommandRunner};
use crate::{Result, SysError};

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,FSTYPE,UUID,PARTUUID,PARTN,START,MOUNTPOINTS,LOG-SEC,MODEL,PKNAME";

/// One row of `lsblk --json` output
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LsblkInfo {
    pub name: String,

    pub path: PathBuf,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub size: u64,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub fstype: Option<String>,

    #[serde(default)]
    pub uuid: Option<String>,

    #[serde(default)]
    pub partuuid: Option<String>,

    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub partn: Option<u64>,

    /// Start sector for partitions
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub start: Option<u64>,

    #[serde(default, deserialize_with = "mountpoints")]
    pub mountpoints: Vec<PathBuf>,

    #[serde(rename = "log-sec", default, deserialize_with = "lenient_opt_u64")]
    pub log_sec: Option<u64>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub pkname: Option<String>,

    #[serde(default)]
    pub children: Vec<LsblkInfo>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkInfo>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn lenient_opt_u64<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<u64>, D::Error> {
    let value = Option::<NumberOrString>::deserialize(de)?;
    Ok(match value {
        Some(NumberOrString::Number(n)) => Some(n),
        Some(NumberOrString::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<u64, D::Error> {
    Ok(lenient_opt_u64(de)?.unwrap_or(0))
}

fn mountpoints<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Vec<PathBuf>, D::Error> {
    let raw = Option::<Vec<Option<PathBuf>>>::deserialize(de)?;
    Ok(raw.unwrap_or_default().into_iter().flatten().collect())
}

impl LsblkInfo {
    pub fn sector_size(&self) -> SectorSize {
        self.log_sec
            .and_then(|b| SectorSize::new(b).ok())
            .unwrap_or_default()
    }

    pub fn fs_type(&self) -> Option<FilesystemType> {
        self.fstype.as_deref().and_then(FilesystemType::from_lsblk)
    }

    /// Depth-first search, including `self`
    pub fn find(&self, pred: &dyn Fn(&LsblkInfo) -> bool) -> Option<&LsblkInfo> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(pred))
    }

    fn to_partition_info(&self, sector_size: SectorSize) -> PartitionInfo {
        PartitionInfo {
            path: self.path.clone(),
            partn: self.partn.and_then(|n| u32::try_from(n).ok()),
            start: Size::new(
                self.start.unwrap_or(0),
                installer_types::Unit::Sectors,
                sector_size,
            ),
            length: Size::from_bytes(self.size, sector_size),
            fs_type: self.fs_type(),
            partuuid: self.partuuid.clone(),
            uuid: self.uuid.clone(),
            mountpoints: self.mountpoints.clone(),
        }
    }

    pub fn to_block_device(&self) -> BlockDevice {
        let sector_size = self.sector_size();
        BlockDevice {
            path: self.path.clone(),
            model: self.model.as_ref().map(|m| m.trim().to_string()),
            total_size: Size::from_bytes(self.size, sector_size),
            sector_size,
            partitions: self
                .children
                .iter()
                .filter(|c| c.kind == "part")
                .map(|c| c.to_partition_info(sector_size))
                .collect(),
        }
    }
}

pub fn parse_lsblk(json: &str) -> Result<Vec<LsblkInfo>> {
    serde_json::from_str::<LsblkOutput>(json)
        .map(|out| out.blockdevices)
        .map_err(|e| SysError::parse("lsblk output", e))
}

/// Read-only view of the host's block devices
pub trait DeviceQuery {
    /// Whole disks with their current partitions
    fn block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// The device at `path` and its children
    fn info(&self, path: &Path) -> Result<LsblkInfo>;

    /// Whatever is mounted at `mountpoint`
    fn find_by_mountpoint(&self, mountpoint: &Path) -> Result<Option<LsblkInfo>>;

    /// Whole disk a partition belongs to
    fn parent_device(&self, path: &Path) -> Result<PathBuf> {
        let info = self.info(path)?;
        info.pkname
            .map(|name| PathBuf::from("/dev").join(name))
            .ok_or_else(|| SysError::DeviceNotFound(format!("parent of {}", path.display())))
    }
}

/// `lsblk` backed device queries
pub struct LsblkDevices<R> {
    runner: R,
}

impl<R: CommandRunner> LsblkDevices<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn lsblk(&self, path: Option<&Path>) -> Result<Vec<LsblkInfo>> {
        let mut cmd = Cmd::new("lsblk").args(["--json", "--bytes", "-o", LSBLK_COLUMNS]);
        if let Some(path) = path {
            cmd = cmd.path_arg(path);
        }
        parse_lsblk(&self.runner.output(&cmd)?)
    }
}

impl<R: CommandRunner> DeviceQuery for LsblkDevices<R> {
    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let devices: Vec<BlockDevice> = self
            .lsblk(None)?
            .iter()
            .filter(|d| d.kind == "disk")
            .map(LsblkInfo::to_block_device)
            .collect();
        debug!("Found {} block devices", devices.len());
        Ok(devices)
    }

    fn info(&self, path: &Path) -> Result<LsblkInfo> {
        self.lsblk(Some(path))?
            .into_iter()
            .next()
            .ok_or_else(|| SysError::DeviceNotFound(path.display().to_string()))
    }

    fn find_by_mountpoint(&self, mountpoint: &Path) -> Result<Option<LsblkInfo>> {
        Ok(self.lsblk(None)?.iter().find_map(|d| {
            d.find(&|i| i.mountpoints.iter().any(|m| m == mountpoint))
                .cloned()
        }))
    }
}
