// SPDX-License-Identifier: GPL-3.0-only

//! Install plan file (TOML or JSON)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bootloader::BootloaderConfiguration;
use crate::error::{LayoutError, Result};
use crate::layout::DiskLayoutConfiguration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZramAlgorithm {
    #[default]
    Zstd,
    Lzo,
    Lz4,
}

impl ZramAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::Lzo => "lzo",
            Self::Lz4 => "lz4",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZramConfig {
    pub enabled: bool,

    #[serde(default)]
    pub algorithm: ZramAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub keymap: String,

    #[serde(default)]
    pub font: Option<String>,
}

fn default_kernels() -> Vec<String> {
    vec!["linux".to_string()]
}

fn default_hostname() -> String {
    "archlinux".to_string()
}

/// Everything needed to run a non-interactive installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPlan {
    pub disk_config: DiskLayoutConfiguration,

    #[serde(default)]
    pub bootloader_config: BootloaderConfiguration,

    #[serde(default = "default_kernels")]
    pub kernels: Vec<String>,

    /// Extra kernel parameters appended after the generated ones
    #[serde(default)]
    pub kernel_params: Vec<String>,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub swap: ZramConfig,

    #[serde(default)]
    pub console: Option<ConsoleConfig>,

    /// Packages installed after the base system
    #[serde(default)]
    pub packages: Vec<String>,

    /// Services enabled on the target
    #[serde(default)]
    pub services: Vec<String>,
}

impl InstallPlan {
    pub fn new(disk_config: DiskLayoutConfiguration) -> Self {
        Self {
            disk_config,
            bootloader_config: BootloaderConfiguration::default(),
            kernels: default_kernels(),
            kernel_params: Vec::new(),
            hostname: default_hostname(),
            swap: ZramConfig::default(),
            console: None,
            packages: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Parse a plan, choosing the format from the file extension
    pub fn from_str_with_path(content: &str, path: &Path) -> Result<Self> {
        let plan: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(content)
                .map_err(|e| LayoutError::Invalid(format!("{}: {e}", path.display())))?,
            _ => toml::from_str(content)
                .map_err(|e| LayoutError::Invalid(format!("{}: {e}", path.display())))?,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Structural checks that do not need the host
    pub fn validate(&self) -> Result<()> {
        if self.kernels.is_empty() {
            return Err(LayoutError::Invalid("at least one kernel is required".into()));
        }
        if self.hostname.trim().is_empty() {
            return Err(LayoutError::Invalid("hostname must not be empty".into()));
        }

        for part in self.disk_config.partitions() {
            if let Some(mp) = &part.mountpoint
                && !mp.is_absolute()
            {
                return Err(LayoutError::RelativeMountpoint(mp.clone()));
            }
        }

        self.disk_config.validate()?;

        let roots = self
            .disk_config
            .partitions()
            .filter(|p| p.is_root() && !self.disk_config.is_container_member(&p.obj_id))
            .count()
            + self
                .disk_config
                .lvm_config
                .as_ref()
                .map_or(0, |lvm| lvm.volumes().filter(|v| v.is_root()).count());
        if roots > 1 {
            return Err(LayoutError::Invalid(format!(
                "{roots} elements are mounted at /"
            )));
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LayoutError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::device::{
        BlockDevice, DeviceModification, FilesystemType, PartitionFlag, PartitionModification,
        PartitionTable,
    };
    use crate::encryption::{DiskEncryption, EncryptionType, Password};
    use crate::layout::DiskLayoutType;
    use crate::size::{SectorSize, Size};

    fn sample_plan() -> InstallPlan {
        let ss = SectorSize::default();
        let disk = BlockDevice {
            path: PathBuf::from("/dev/sda"),
            model: Some("QEMU HARDDISK".into()),
            total_size: Size::gib(64, ss),
            sector_size: ss,
            partitions: Vec::new(),
        };
        let mut dev = DeviceModification::new(disk, true, PartitionTable::Gpt);
        dev.add_partition(
            PartitionModification::create(Size::mib(1, ss), Size::gib(1, ss), Some(FilesystemType::Fat32))
                .with_mountpoint("/boot")
                .with_flag(PartitionFlag::Esp),
        );
        let root = PartitionModification::create(
            Size::mib(1025, ss),
            Size::gib(60, ss),
            Some(FilesystemType::Ext4),
        )
        .with_mountpoint("/");
        let root_id = root.obj_id;
        dev.add_partition(root);

        let mut layout = DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dev]);
        layout.disk_encryption = Some(
            DiskEncryption::new(EncryptionType::Luks, Some(Password::new("pw")), [root_id], [])
                .unwrap(),
        );
        InstallPlan::new(layout)
    }

    #[test]
    fn toml_and_json_round_trip() {
        let plan = sample_plan();

        let toml_text = plan.to_toml().unwrap();
        let parsed = InstallPlan::from_str_with_path(&toml_text, Path::new("plan.toml")).unwrap();
        assert_eq!(parsed, plan);

        let json_text = serde_json::to_string(&plan).unwrap();
        let parsed = InstallPlan::from_str_with_path(&json_text, Path::new("plan.json")).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn rejects_two_roots() {
        let mut plan = sample_plan();
        let ss = SectorSize::default();
        plan.disk_config.device_modifications[0].add_partition(
            PartitionModification::create(Size::gib(62, ss), Size::gib(1, ss), Some(FilesystemType::Ext4))
                .with_mountpoint("/"),
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn rejects_relative_mountpoints() {
        let mut plan = sample_plan();
        plan.disk_config.device_modifications[0].partitions[0].mountpoint =
            Some(PathBuf::from("boot"));
        assert_eq!(
            plan.validate(),
            Err(LayoutError::RelativeMountpoint(PathBuf::from("boot")))
        );
    }
}
