// SPDX-License-Identifier: GPL-3.0-only

//! Mounting, swap activation and mount table inspection

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::command::{Cmd, CommandRunner};
use crate::{Result, SysError};

/// One line of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Mount `device` at `target`, creating the directory first
pub fn mount(
    runner: &dyn CommandRunner,
    device: &Path,
    target: &Path,
    fs_type: Option<&str>,
    options: &[String],
) -> Result<()> {
    fs::create_dir_all(target)?;

    let mut cmd = Cmd::new("mount");
    if let Some(fs_type) = fs_type {
        cmd = cmd.args(["-t", fs_type]);
    }
    if !options.is_empty() {
        cmd = cmd.args(["-o".to_string(), options.join(",")]);
    }
    let cmd = cmd.path_arg(device).path_arg(target);

    info!("Mounting {} at {}", device.display(), target.display());
    runner.run(&cmd)?;
    Ok(())
}

pub fn swapon(runner: &dyn CommandRunner, device: &Path) -> Result<()> {
    info!("Activating swap on {}", device.display());
    runner.run(&Cmd::new("swapon").path_arg(device))?;
    Ok(())
}

pub fn swapoff(runner: &dyn CommandRunner, device: &Path) -> Result<()> {
    runner.run(&Cmd::new("swapoff").path_arg(device))?;
    Ok(())
}

pub fn umount(runner: &dyn CommandRunner, target: &Path) -> Result<()> {
    runner.run(&Cmd::new("umount").path_arg(target))?;
    Ok(())
}

/// Unmount `target` and everything below it
pub fn umount_recursive(runner: &dyn CommandRunner, target: &Path) -> Result<()> {
    debug!("Recursively unmounting {}", target.display());
    runner.run(&Cmd::new("umount").arg("--recursive").path_arg(target))?;
    Ok(())
}

pub fn read_mountinfo() -> Result<Vec<MountEntry>> {
    parse_mountinfo(&fs::read_to_string("/proc/self/mountinfo")?)
}

/// Mount points at or below `root`, deepest first
pub fn mounts_under(entries: &[MountEntry], root: &Path) -> Vec<PathBuf> {
    let mut points: Vec<PathBuf> = entries
        .iter()
        .filter(|e| e.mount_point.starts_with(root))
        .map(|e| e.mount_point.clone())
        .collect();
    points.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    points.dedup();
    points
}

pub fn parse_mountinfo(input: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let invalid = || SysError::parse("mountinfo line", line);
        let (left, right) = line.split_once(" - ").ok_or_else(invalid)?;

        let mount_point = left.split_whitespace().nth(4).ok_or_else(invalid)?;
        let mut right_fields = right.split_whitespace();
        let fs_type = right_fields.next().ok_or_else(invalid)?;
        let source = right_fields.next().unwrap_or_default();

        entries.push(MountEntry {
            mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            fs_type: fs_type.to_string(),
            source: unescape_mount_field(source),
        });
    }

    Ok(entries)
}

fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(u8::is_ascii_digit)
            && let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8)
        {
            output.push(num as char);
            index += 4;
            continue;
        }

        output.push(bytes[index] as char);
        index += 1;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    const SAMPLE: &str = "36 25 8:2 / / rw,relatime - ext4 /dev/nvme0n1p2 rw\n\
        90 36 8:3 / /mnt rw,relatime - btrfs /dev/mapper/root rw,subvol=/@\n\
        91 90 8:1 / /mnt/boot rw,relatime - vfat /dev/sda1 rw,fmask=0077\n\
        92 90 8:3 / /mnt/my\\040home rw - btrfs /dev/mapper/root rw\n";

    #[test]
    fn parses_and_unescapes() {
        let entries = parse_mountinfo(SAMPLE).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].mount_point, PathBuf::from("/mnt/my home"));
        assert_eq!(entries[2].fs_type, "vfat");
        assert_eq!(entries[1].source, "/dev/mapper/root");
    }

    #[test]
    fn lists_nested_mounts_deepest_first() {
        let entries = parse_mountinfo(SAMPLE).unwrap();
        let under = mounts_under(&entries, Path::new("/mnt"));
        assert_eq!(under.last(), Some(&PathBuf::from("/mnt")));
        assert_eq!(under.len(), 3);
        assert!(under.contains(&PathBuf::from("/mnt/boot")));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_mountinfo("garbage line").is_err());
    }

    #[test]
    fn mount_joins_options() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("boot");
        let runner = ScriptedRunner::new();
        mount(
            &runner,
            Path::new("/dev/sda1"),
            &target,
            Some("vfat"),
            &["fmask=0077".to_string(), "dmask=0077".to_string()],
        )
        .unwrap();
        assert!(target.is_dir());
        assert_eq!(
            runner.rendered()[0],
            format!("mount -t vfat -o fmask=0077,dmask=0077 /dev/sda1 {}", target.display())
        );
    }
}
