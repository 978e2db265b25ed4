// SPDX-License-Identifier: GPL-3.0-only

//! Host CPU vendor from `/proc/cpuinfo`

use std::fs;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

impl CpuVendor {
    /// Microcode package loaded by the initramfs `microcode` hook
    pub fn microcode_package(self) -> &'static str {
        match self {
            Self::Intel => "intel-ucode",
            Self::Amd => "amd-ucode",
        }
    }
}

/// Vendor of the running CPU; `None` for vendors without a microcode package
pub fn cpu_vendor() -> Result<Option<CpuVendor>> {
    Ok(parse_vendor(&fs::read_to_string("/proc/cpuinfo")?))
}

pub fn parse_vendor(cpuinfo: &str) -> Option<CpuVendor> {
    let vendor = cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "vendor_id")
        .map(|(_, value)| value.trim())?;
    match vendor {
        "GenuineIntel" => Some(CpuVendor::Intel),
        "AuthenticAMD" => Some(CpuVendor::Amd),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_vendor_id() {
        let intel = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\n";
        assert_eq!(parse_vendor(intel), Some(CpuVendor::Intel));
        assert_eq!(parse_vendor("vendor_id\t: AuthenticAMD\n"), Some(CpuVendor::Amd));
        assert_eq!(parse_vendor("vendor_id\t: HygonGenuine\n"), None);
        // aarch64 has no vendor_id line
        assert_eq!(parse_vendor("processor\t: 0\nCPU implementer\t: 0x41\n"), None);
    }

    #[test]
    fn vendors_map_to_ucode_packages() {
        assert_eq!(CpuVendor::Intel.microcode_package(), "intel-ucode");
        assert_eq!(CpuVendor::Amd.microcode_package(), "amd-ucode");
    }
}
