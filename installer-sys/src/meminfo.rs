// SPDX-License-Identifier: GPL-3.0-only

//! Host memory size from `/proc/meminfo`

use std::fs;

use crate::{Result, SysError};

/// `MemTotal` in KiB
pub fn mem_total_kb() -> Result<u64> {
    parse_mem_total(&fs::read_to_string("/proc/meminfo")?)
}

pub fn parse_mem_total(meminfo: &str) -> Result<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| SysError::parse("/proc/meminfo", "no MemTotal line"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_mem_total() {
        let sample = "MemTotal:       16318412 kB\nMemFree:         1203400 kB\n";
        assert_eq!(parse_mem_total(sample).unwrap(), 16_318_412);
        assert!(parse_mem_total("MemFree: 12 kB\n").is_err());
    }
}
