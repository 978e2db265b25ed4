// SPDX-License-Identifier: GPL-3.0-only

//! LVM tooling: physical volumes, volume groups and logical volumes

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::command::{Cmd, CommandRunner};
use crate::{Result, SysError};

const REPORT_ARGS: [&str; 6] = ["--noheadings", "--units", "b", "--nosuffix", "--separator", "\t"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvSegmentRow {
    pub pv_name: PathBuf,
    pub vg_name: String,
    pub lv_name: String,
}

fn parse_tabbed_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|part| part.trim().to_string())
        .collect()
}

pub fn parse_pv_segments(output: &str) -> Vec<PvSegmentRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 3 || cols[2].is_empty() {
                return None;
            }
            Some(PvSegmentRow {
                pv_name: PathBuf::from(&cols[0]),
                vg_name: cols[1].clone(),
                lv_name: cols[2].clone(),
            })
        })
        .collect()
}

fn ensure_enabled() -> Result<()> {
    if !cfg!(feature = "lvm-tools") {
        return Err(SysError::ToolMissing("lvm (lvm-tools feature disabled)".into()));
    }
    Ok(())
}

pub fn pv_create(runner: &dyn CommandRunner, devices: &[PathBuf]) -> Result<()> {
    ensure_enabled()?;
    info!("Creating physical volumes on {devices:?}");
    let cmd = Cmd::new("pvcreate")
        .arg("--yes")
        .args(devices.iter().map(|d| d.display().to_string()));
    runner.run(&cmd)?;
    Ok(())
}

pub fn vg_create(runner: &dyn CommandRunner, name: &str, devices: &[PathBuf]) -> Result<()> {
    ensure_enabled()?;
    info!("Creating volume group {name}");
    let cmd = Cmd::new("vgcreate")
        .arg("--yes")
        .arg(name)
        .args(devices.iter().map(|d| d.display().to_string()));
    runner.run(&cmd)?;
    Ok(())
}

/// Create a logical volume; `size_bytes` of `None` takes all remaining space
pub fn lv_create(
    runner: &dyn CommandRunner,
    vg_name: &str,
    lv_name: &str,
    size_bytes: Option<u64>,
) -> Result<()> {
    ensure_enabled()?;
    info!("Creating logical volume {vg_name}/{lv_name}");
    let cmd = Cmd::new("lvcreate").args(["--yes", "--wipesignatures", "y"]);
    let cmd = match size_bytes {
        Some(bytes) => cmd.args(["-L".to_string(), format!("{bytes}B")]),
        None => cmd.args(["-l", "100%FREE"]),
    };
    runner.run(&cmd.args([vg_name, "-n", lv_name]))?;
    Ok(())
}

/// Scan for volume groups on newly unlocked or attached devices
pub fn vg_scan(runner: &dyn CommandRunner) -> Result<()> {
    ensure_enabled()?;
    runner.run(&Cmd::new("vgscan").arg("--mknodes"))?;
    Ok(())
}

pub fn vg_activate(runner: &dyn CommandRunner, vg_name: &str) -> Result<()> {
    ensure_enabled()?;
    debug!("Activating volume group {vg_name}");
    runner.run(&Cmd::new("vgchange").args(["-ay", vg_name]))?;
    Ok(())
}

pub fn lv_activate(runner: &dyn CommandRunner, lv_path: &Path) -> Result<()> {
    ensure_enabled()?;
    runner.run(&Cmd::new("lvchange").arg("-ay").path_arg(lv_path))?;
    Ok(())
}

pub fn vg_deactivate(runner: &dyn CommandRunner, vg_name: &str) -> Result<()> {
    ensure_enabled()?;
    runner.run(&Cmd::new("vgchange").args(["-an", vg_name]))?;
    Ok(())
}

/// Physical volume backing a logical volume (first segment)
pub fn pv_of_volume(runner: &dyn CommandRunner, vg_name: &str, lv_name: &str) -> Result<PathBuf> {
    ensure_enabled()?;
    let out = runner.output(
        &Cmd::new("pvs")
            .arg("--segments")
            .args(REPORT_ARGS)
            .args(["-o", "pv_name,vg_name,lv_name"]),
    )?;
    parse_pv_segments(&out)
        .into_iter()
        .find(|row| row.vg_name == vg_name && row.lv_name == lv_name)
        .map(|row| row.pv_name)
        .ok_or_else(|| SysError::DeviceNotFound(format!("physical volume of {vg_name}/{lv_name}")))
}
