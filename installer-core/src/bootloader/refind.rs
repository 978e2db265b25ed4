// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{BootContext, write_pacman_hook};
use crate::cmdline::RootIdentity;
use crate::error::{InstallError, Result};

/// Where the kernels live relative to the `refind_linux.conf` that names them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelLocation {
    /// Top level of a separate `/boot` or of an ESP mounted at `/boot`
    PartitionRoot,

    /// `/boot` inside the root filesystem, ESP mounted elsewhere
    RootFilesystem,
}

fn initrd_path(location: KernelLocation, kernel: &str, subvolume: Option<&str>) -> String {
    match (location, subvolume) {
        (KernelLocation::PartitionRoot, _) => format!("initrd=\\initramfs-{kernel}.img"),
        (KernelLocation::RootFilesystem, Some(subvol)) => {
            format!("initrd={subvol}\\boot\\initramfs-{kernel}.img")
        }
        (KernelLocation::RootFilesystem, None) => format!("initrd=\\boot\\initramfs-{kernel}.img"),
    }
}

fn refind_linux_conf(
    kernels: &[String],
    cmdline: &str,
    location: KernelLocation,
    subvolume: Option<&str>,
    uki: bool,
) -> String {
    let mut lines = Vec::new();
    for kernel in kernels {
        if uki {
            lines.push(format!("\"Arch Linux ({kernel}) UKI\" \"{cmdline}\""));
        } else {
            let initrd = initrd_path(location, kernel, subvolume);
            lines.push(format!("\"Arch Linux ({kernel})\" \"{cmdline} {initrd}\""));
        }
    }
    lines.join("\n") + "\n"
}

pub(super) fn install(ctx: &BootContext<'_>) -> Result<()> {
    debug!("Installing rEFInd bootloader");
    ctx.strap(&["refind"])?;
    info!("rEFInd boot partition: {}", ctx.boot.describe());

    let (efi, efi_mountpoint) = ctx.require_efi()?;
    info!("rEFInd EFI partition: {}", efi.describe());

    ctx.host
        .runner
        .run(&ctx.chroot("refind-install"))
        .map_err(|e| {
            InstallError::disk(
                format!("could not install rEFInd to {}", ctx.in_target(efi_mountpoint).display()),
                e,
            )
        })?;

    let boot_mountpoint = ctx.boot_mountpoint()?;
    let (config_path, location): (PathBuf, _) = if !ctx.boot_is_efi() {
        (ctx.in_target(boot_mountpoint).join("refind_linux.conf"), KernelLocation::PartitionRoot)
    } else if efi_mountpoint == Path::new("/boot") {
        (ctx.target.join("boot/refind_linux.conf"), KernelLocation::PartitionRoot)
    } else {
        (ctx.target.join("boot/refind_linux.conf"), KernelLocation::RootFilesystem)
    };

    let cmdline = ctx.params(RootIdentity::PartUuid).join(" ");
    let content = refind_linux_conf(
        ctx.kernels,
        &cmdline,
        location,
        ctx.root.subvolume.as_deref(),
        ctx.config.uki,
    );
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, content)?;

    write_pacman_hook(
        ctx.target,
        "99-refind.hook",
        "refind",
        "Updating rEFInd on ESP",
        "/usr/bin/refind-install",
    )
}

#[cfg(test)]
mod tests {
    use installer_sys::Firmware;
    use installer_types::{Bootloader, FilesystemType};

    use super::super::fixtures::{Fixture, config};
    use super::super::install_bootloader;
    use super::*;

    #[test]
    fn initrd_paths_follow_kernel_location() {
        assert_eq!(
            initrd_path(KernelLocation::PartitionRoot, "linux", Some("@")),
            "initrd=\\initramfs-linux.img"
        );
        assert_eq!(
            initrd_path(KernelLocation::RootFilesystem, "linux", Some("@")),
            "initrd=@\\boot\\initramfs-linux.img"
        );
        assert_eq!(
            initrd_path(KernelLocation::RootFilesystem, "linux", None),
            "initrd=\\boot\\initramfs-linux.img"
        );
    }

    #[test]
    fn esp_elsewhere_puts_kernels_on_root() {
        let fx = Fixture::new("/efi", None);
        let ctx = fx.context(Firmware::UEFI64, config(Bootloader::Refind));
        install_bootloader(&ctx).unwrap();

        assert_eq!(
            fx.read("boot/refind_linux.conf"),
            "\"Arch Linux (linux)\" \"root=PARTUUID=puuid-3 rw rootfstype=ext4 initrd=\\boot\\initramfs-linux.img\"\n"
        );
        assert!(fx.read("etc/pacman.d/hooks/99-refind.hook").contains("Exec = /usr/bin/refind-install\n"));
        assert_eq!(
            fx.runner.rendered(),
            vec![format!("arch-chroot {} refind-install", fx.target.path().display())]
        );
    }

    #[test]
    fn separate_boot_holds_config() {
        let fx = Fixture::new("/efi", Some(FilesystemType::Ext4));
        let ctx = fx.context(Firmware::UEFI64, config(Bootloader::Refind));
        install_bootloader(&ctx).unwrap();
        assert!(fx.read("boot/refind_linux.conf").ends_with("initrd=\\initramfs-linux.img\"\n"));
    }

    #[test]
    fn install_failure_is_a_disk_error() {
        let mut fx = Fixture::new("/efi", None);
        fx.runner = installer_sys::testing::ScriptedRunner::new().fail("arch-chroot", 1, "no ESP");
        let ctx = fx.context(Firmware::UEFI64, config(Bootloader::Refind));
        let err = install_bootloader(&ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Disk);
        assert!(!fx.path("boot/refind_linux.conf").exists());
    }
}
