// SPDX-License-Identifier: GPL-3.0-only

//! Boot firmware detection

use std::fs;
use std::path::Path;

use tracing::debug;

/// Boot mode of the machine the installer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firmware {
    /// Booted through UEFI
    pub uefi: bool,

    /// UEFI firmware word size, 32 or 64
    pub bitness: u8,
}

impl Firmware {
    pub const BIOS: Firmware = Firmware {
        uefi: false,
        bitness: 64,
    };

    pub const UEFI64: Firmware = Firmware {
        uefi: true,
        bitness: 64,
    };

    /// Probe `/sys/firmware/efi`
    pub fn detect() -> Self {
        Self::detect_in(Path::new("/sys/firmware/efi"))
    }

    pub fn detect_in(efi_dir: &Path) -> Self {
        if !efi_dir.is_dir() {
            debug!("No EFI firmware directory, assuming BIOS");
            return Self::BIOS;
        }
        let bitness = fs::read_to_string(efi_dir.join("fw_platform_size"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(64);
        Self {
            uefi: true,
            bitness,
        }
    }

    /// GRUB `--target` for this firmware
    pub fn grub_target(&self) -> &'static str {
        match (self.uefi, self.bitness) {
            (false, _) => "i386-pc",
            (true, 32) => "i386-efi",
            (true, _) => "x86_64-efi",
        }
    }

    /// Name of the removable-media loader for this firmware
    pub fn efi_fallback_loader(&self) -> &'static str {
        if self.bitness == 32 {
            "BOOTIA32.EFI"
        } else {
            "BOOTX64.EFI"
        }
    }
}
