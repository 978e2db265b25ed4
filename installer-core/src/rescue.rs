// SPDX-License-Identifier: GPL-3.0-only

//! Explicit teardown of a target
//!
//! A failed session leaves everything mounted and unlocked for inspection.
//! These functions undo that on request: unmount the tree, export pools,
//! deactivate volume groups and close LUKS mappers.

use std::path::Path;
use std::time::Duration;

use installer_sys::{Cmd, lvm, mount, zfs};
use installer_types::DiskLayoutConfiguration;
use tracing::{debug, info, warn};

use crate::apply::with_planned_paths;
use crate::error::{InstallError, Result};
use crate::host::Host;
use crate::mount::MountState;

pub const UNMOUNT_ATTEMPTS: u32 = 3;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What a teardown managed to undo
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub unmounted: bool,
    pub closed: Vec<String>,
    pub failures: usize,
}

/// `umount --recursive` on `target`, retried while something still holds it
pub fn unmount_all(host: &Host<'_>, target: &Path) -> Result<()> {
    info!("Unmounting everything under {}", target.display());
    let mut attempt = 1;
    loop {
        match mount::umount_recursive(host.runner, target) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < UNMOUNT_ATTEMPTS => {
                warn!("Unmounting {} failed (attempt {attempt}): {e}", target.display());
                host.clock.sleep(UNMOUNT_RETRY_DELAY);
                attempt += 1;
            }
            Err(e) => return Err(InstallError::disk(format!("could not unmount {}", target.display()), e)),
        }
    }
}

/// Close `name`; a mapper that was never opened is not a failure
fn close_mapper(host: &Host<'_>, name: &str, report: &mut TeardownReport) {
    match host.runner.run(&Cmd::new("cryptsetup").arg("close").arg(name)) {
        Ok(_) => report.closed.push(name.to_string()),
        Err(e) => debug!("cryptsetup close {name}: {e}"),
    }
}

/// Tear down a target installed from `layout`
///
/// Continues past failures; the returned report counts them.
pub fn teardown(host: &Host<'_>, target: &Path, layout: &DiskLayoutConfiguration) -> TeardownReport {
    let mut report = TeardownReport::default();
    let layout = with_planned_paths(layout);
    let encryption = layout.encryption();

    for part in layout.partitions().filter(|p| p.is_swap()) {
        let device = match (encryption.contains(&part.obj_id), part.mapper_name(), &part.dev_path) {
            (true, Ok(mapper), _) => Path::new("/dev/mapper").join(mapper),
            (false, _, Some(dev)) => dev.clone(),
            _ => continue,
        };
        if let Err(e) = mount::swapoff(host.runner, &device) {
            debug!("swapoff {}: {e}", device.display());
        }
    }

    match unmount_all(host, target) {
        Ok(()) => report.unmounted = true,
        Err(e) => {
            warn!("{e}");
            report.failures += 1;
        }
    }
    match mount::read_mountinfo() {
        Ok(entries) => {
            for left in mount::mounts_under(&entries, target) {
                warn!("{} is still mounted", left.display());
            }
        }
        Err(e) => debug!("could not read the mount table: {e}"),
    }

    if let Some(zfs_config) = &layout.zfs_config
        && let Err(e) = zfs::zpool_export(host.runner, &zfs_config.pool.name)
    {
        warn!("Failed to export {}: {e}", zfs_config.pool.name);
        report.failures += 1;
    }

    if let Some(lvm_config) = &layout.lvm_config {
        for volume in lvm_config.volumes().filter(|v| encryption.contains(&v.obj_id)) {
            if let Ok(mapper) = volume.mapper_name() {
                close_mapper(host, &mapper, &mut report);
            }
        }
        for group in &lvm_config.vol_groups {
            if let Err(e) = lvm::vg_deactivate(host.runner, &group.name) {
                warn!("Failed to deactivate {}: {e}", group.name);
                report.failures += 1;
            }
        }
    }

    for part in layout.partitions().filter(|p| encryption.contains(&p.obj_id)) {
        if let Ok(mapper) = part.mapper_name() {
            close_mapper(host, &mapper, &mut report);
        }
    }

    info!(
        "Teardown of {} closed {} container(s) with {} failure(s)",
        target.display(),
        report.closed.len(),
        report.failures
    );
    report
}

/// Unmount `target` and lock every container a session opened
pub fn release(host: &Host<'_>, target: &Path, mounts: &mut MountState<'_>) -> Result<()> {
    unmount_all(host, target)?;
    let failed = mounts.lock_all();
    if failed > 0 {
        return Err(InstallError::Disk(format!("{failed} container(s) could not be locked")));
    }
    Ok(())
}
