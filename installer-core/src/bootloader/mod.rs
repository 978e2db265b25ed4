// SPDX-License-Identifier: GPL-3.0-only

//! Bootloader installation
//!
//! One free function per loader, picked by an exhaustive match. All of them
//! share the kernel command line built from the resolved root.

mod efistub;
mod grub;
mod limine;
mod refind;
mod systemd;

use std::fs;
use std::path::{Path, PathBuf};

use installer_sys::Cmd;
use installer_types::device::strip_root;
use installer_types::{
    Bootloader, BootloaderConfiguration, DiskLayoutConfiguration, PartitionModification,
};
use tracing::info;

use crate::cmdline::{ResolvedRoot, RootIdentity, kernel_params};
use crate::error::{InstallError, Result};
use crate::host::Host;

pub use grub::{enable_cryptodisk, set_grub_cmdline};
pub use limine::limine_conf;
pub use systemd::{loader_entry, update_loader_conf};

const PACMAN_HOOKS: &str = "etc/pacman.d/hooks";

/// Everything a loader needs to know about the mounted target
#[derive(Debug)]
pub struct BootContext<'a> {
    pub host: Host<'a>,
    pub target: &'a Path,
    pub layout: &'a DiskLayoutConfiguration,
    pub root: ResolvedRoot,
    pub kernels: &'a [String],
    pub extra_params: &'a [String],
    pub zram: bool,
    pub efi: Option<&'a PartitionModification>,

    /// Partition holding the kernels; the ESP when there is no separate `/boot`
    pub boot: &'a PartitionModification,
    pub config: BootloaderConfiguration,
}

impl<'a> BootContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Host<'a>,
        target: &'a Path,
        layout: &'a DiskLayoutConfiguration,
        root: ResolvedRoot,
        kernels: &'a [String],
        extra_params: &'a [String],
        zram: bool,
        config: BootloaderConfiguration,
    ) -> Result<Self> {
        let efi = layout.efi_partition();
        let boot = match (layout.boot_partition(), efi) {
            (Some(boot), _) => boot,
            (None, Some(efi)) if host.firmware.uefi => efi,
            _ => {
                return Err(InstallError::Configuration(format!(
                    "could not detect a boot partition under {}",
                    target.display()
                )));
            }
        };

        Ok(Self {
            host,
            target,
            layout,
            root,
            kernels,
            extra_params,
            zram,
            efi,
            boot,
            config,
        })
    }

    pub fn params(&self, identity: RootIdentity) -> Vec<String> {
        kernel_params(&self.root, identity, self.zram, self.extra_params)
    }

    /// Space separated parameters naming root by PARTUUID
    pub fn cmdline(&self) -> String {
        self.params(RootIdentity::PartUuid).join(" ")
    }

    pub fn uefi(&self) -> bool {
        self.host.firmware.uefi
    }

    fn boot_is_efi(&self) -> bool {
        self.efi.is_some_and(|efi| efi.obj_id == self.boot.obj_id)
    }

    fn strap(&self, packages: &[&str]) -> Result<()> {
        let packages: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
        self.host.packages.strap(self.target, &packages)?;
        Ok(())
    }

    fn chroot(&self, program: &str) -> Cmd {
        Cmd::chroot(self.target, program)
    }

    fn require_efi(&self) -> Result<(&'a PartitionModification, &'a Path)> {
        let efi = self
            .efi
            .ok_or_else(|| InstallError::Configuration("could not detect the EFI system partition".into()))?;
        let mountpoint = efi
            .mountpoint
            .as_deref()
            .ok_or_else(|| InstallError::Configuration("the EFI system partition is not mounted".into()))?;
        Ok((efi, mountpoint))
    }

    fn boot_mountpoint(&self) -> Result<&'a Path> {
        self.boot.mountpoint.as_deref().ok_or_else(|| {
            InstallError::Configuration(format!("{} is not mounted", self.boot.describe()))
        })
    }

    /// `mountpoint` inside the target
    fn in_target(&self, mountpoint: &Path) -> PathBuf {
        self.target.join(strip_root(mountpoint))
    }

    /// Whole disk holding `part`
    fn parent_disk(&self, part: &PartitionModification) -> Result<PathBuf> {
        if let Some(device) = self.layout.device_of(&part.obj_id) {
            return Ok(device.device.path.clone());
        }
        Ok(self.host.devices.parent_device(part.safe_dev_path()?)?)
    }

    fn partn(&self, part: &PartitionModification) -> Result<u32> {
        part.partn.ok_or_else(|| {
            InstallError::Disk(format!("partition number of {} is unknown", part.describe()))
        })
    }
}

/// Pacman hook at `/etc/pacman.d/hooks/<name>`
fn write_pacman_hook(target: &Path, name: &str, package: &str, description: &str, exec: &str) -> Result<()> {
    let dir = target.join(PACMAN_HOOKS);
    fs::create_dir_all(&dir)?;
    let content = format!(
        "[Trigger]\n\
         Operation = Install\n\
         Operation = Upgrade\n\
         Type = Package\n\
         Target = {package}\n\
         \n\
         [Action]\n\
         Description = {description}\n\
         When = PostTransaction\n\
         Exec = {exec}\n"
    );
    fs::write(dir.join(name), content)?;
    Ok(())
}

pub fn install_bootloader(ctx: &BootContext<'_>) -> Result<()> {
    let bootloader = ctx.config.bootloader;
    if bootloader.requires_uefi() && !ctx.uefi() {
        return Err(InstallError::HardwareIncompatibility(format!(
            "{bootloader} requires a UEFI system"
        )));
    }

    info!(
        "Adding bootloader {bootloader} to {}",
        ctx.boot.describe()
    );
    match bootloader {
        Bootloader::NoBootloader => {
            info!("No bootloader requested, skipping");
            Ok(())
        }
        Bootloader::Systemd => systemd::install(ctx),
        Bootloader::Grub => grub::install(ctx),
        Bootloader::Limine => limine::install(ctx),
        Bootloader::Efistub => efistub::install(ctx),
        Bootloader::Refind => refind::install(ctx),
    }
}
