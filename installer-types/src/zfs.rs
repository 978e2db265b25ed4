// SPDX-License-Identifier: GPL-3.0-only

//! ZFS pool and dataset plan types

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZfsLayoutType {
    #[default]
    Default,
}

/// A dataset created below `<pool>/<prefix>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZfsDatasetConfig {
    /// Name relative to the dataset prefix, may contain `/`
    pub name: String,

    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    /// Extra `-o key=value` properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ZfsDatasetConfig {
    pub fn new(name: impl Into<String>, mountpoint: Option<&str>) -> Self {
        Self {
            name: name.into(),
            mountpoint: mountpoint.map(PathBuf::from),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_root(&self) -> bool {
        self.mountpoint.as_deref() == Some(Path::new("/"))
    }

    /// Number of path components, parents sort before children
    pub fn depth(&self) -> usize {
        self.name.split('/').count()
    }
}

/// Root, home, logs and package cache, mirroring the default btrfs subvolumes
pub fn default_zfs_datasets() -> Vec<ZfsDatasetConfig> {
    vec![
        ZfsDatasetConfig::new("root", Some("/")).with_property("canmount", "noauto"),
        ZfsDatasetConfig::new("home", Some("/home")),
        ZfsDatasetConfig::new("var/log", Some("/var/log")),
        ZfsDatasetConfig::new("var/cache/pacman/pkg", Some("/var/cache/pacman/pkg")),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZfsPool {
    pub name: String,

    /// Object ids of the partitions used as vdevs
    pub pvs: Vec<Uuid>,

    /// Parent dataset every planned dataset is created under
    pub dataset_prefix: String,

    pub datasets: Vec<ZfsDatasetConfig>,

    pub compression: String,

    /// Alternate root the pool is imported at during installation
    pub mountpoint: PathBuf,
}

impl ZfsPool {
    /// `<pool>/<prefix>`
    pub fn base_dataset(&self) -> String {
        format!("{}/{}", self.name, self.dataset_prefix)
    }

    pub fn full_name(&self, dataset: &ZfsDatasetConfig) -> String {
        format!("{}/{}", self.base_dataset(), dataset.name)
    }

    pub fn root_dataset(&self) -> Option<&ZfsDatasetConfig> {
        self.datasets.iter().find(|d| d.is_root())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZfsConfiguration {
    #[serde(default)]
    pub config_type: ZfsLayoutType,

    pub pool: ZfsPool,
}
