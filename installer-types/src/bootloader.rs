// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bootloader {
    NoBootloader,
    Systemd,
    #[default]
    Grub,
    Limine,
    Efistub,
    Refind,
}

impl Bootloader {
    /// Can boot unified kernel images
    pub fn has_uki_support(self) -> bool {
        !matches!(self, Self::NoBootloader)
    }

    /// Can be installed to the fallback `EFI/BOOT` path
    pub fn has_removable_support(self) -> bool {
        matches!(self, Self::Grub | Self::Limine)
    }

    pub fn requires_uefi(self) -> bool {
        matches!(self, Self::Systemd | Self::Efistub | Self::Refind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoBootloader => "No bootloader",
            Self::Systemd => "Systemd-boot",
            Self::Grub => "Grub",
            Self::Limine => "Limine",
            Self::Efistub => "Efistub",
            Self::Refind => "Refind",
        }
    }
}

impl fmt::Display for Bootloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootloaderConfiguration {
    #[serde(default)]
    pub bootloader: Bootloader,

    /// Boot unified kernel images instead of separate kernel and initramfs
    #[serde(default)]
    pub uki: bool,

    /// Install to the removable fallback path instead of registering an NVRAM entry
    #[serde(default)]
    pub removable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_predicates() {
        assert!(Bootloader::Grub.has_removable_support());
        assert!(Bootloader::Limine.has_removable_support());
        assert!(!Bootloader::Systemd.has_removable_support());
        assert!(!Bootloader::NoBootloader.has_uki_support());
        assert!(Bootloader::Efistub.requires_uefi());
        assert!(!Bootloader::Grub.requires_uefi());
    }
}
