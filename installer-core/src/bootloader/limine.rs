// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use installer_sys::Cmd;
use tracing::{debug, info};

use super::{BootContext, write_pacman_hook};
use crate::cmdline::RootIdentity;
use crate::error::{InstallError, Result};

const LIMINE_SHARE: &str = "usr/share/limine";
const EFI_BINARIES: [&str; 2] = ["BOOTIA32.EFI", "BOOTX64.EFI"];

/// `limine.conf` with one entry per kernel
///
/// `path_root` is the Limine resource holding the kernels, `boot()` or
/// `uuid(<partuuid>)`.
pub fn limine_conf(kernels: &[String], cmdline: &str, path_root: &str, uki: bool) -> String {
    let mut conf = String::from("timeout: 5\n");
    for kernel in kernels {
        let entry = if uki {
            vec![
                "protocol: efi".to_string(),
                format!("path: boot():/EFI/Linux/arch-{kernel}.efi"),
                format!("cmdline: {cmdline}"),
            ]
        } else {
            vec![
                "protocol: linux".to_string(),
                format!("path: {path_root}:/vmlinuz-{kernel}"),
                format!("cmdline: {cmdline}"),
                format!("module_path: {path_root}:/initramfs-{kernel}.img"),
            ]
        };
        conf.push_str(&format!("\n/Arch Linux ({kernel})\n"));
        for line in entry {
            conf.push_str(&format!("    {line}\n"));
        }
    }
    conf
}

fn copy_files(from: &Path, to: &Path, files: &[&str]) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for file in files {
        fs::copy(from.join(file), to.join(file))?;
    }
    Ok(())
}

/// Returns where `limine.conf` goes and the command the upgrade hook runs
fn install_uefi(ctx: &BootContext<'_>) -> Result<(PathBuf, String)> {
    ctx.strap(&["efibootmgr"])?;
    let (efi, efi_mountpoint) = ctx.require_efi()?;
    info!("Limine EFI partition: {}", efi.describe());

    let subdir = if ctx.config.removable { "BOOT" } else { "arch-limine" };
    let efi_dir = ctx.in_target(efi_mountpoint).join("EFI").join(subdir);
    let efi_dir_in_target = efi_mountpoint.join("EFI").join(subdir);

    let config_path = if ctx.config.removable {
        let boot_limine = ctx.target.join("boot/limine");
        fs::create_dir_all(&boot_limine)?;
        boot_limine.join("limine.conf")
    } else {
        efi_dir.join("limine.conf")
    };

    copy_files(&ctx.target.join(LIMINE_SHARE), &efi_dir, &EFI_BINARIES).map_err(|e| {
        InstallError::disk(
            format!("failed to install Limine in {}", ctx.in_target(efi_mountpoint).display()),
            e,
        )
    })?;

    let hook = EFI_BINARIES
        .iter()
        .map(|file| format!("/usr/bin/cp /usr/share/limine/{file} {}/", efi_dir_in_target.display()))
        .collect::<Vec<_>>()
        .join(" && ");

    if !ctx.config.removable {
        let loader = format!(
            "\\EFI\\arch-limine\\{}",
            ctx.host.firmware.efi_fallback_loader()
        );
        let cmd = Cmd::new("efibootmgr")
            .arg("--create")
            .arg("--disk")
            .path_arg(&ctx.parent_disk(efi)?)
            .arg("--part")
            .arg(ctx.partn(efi)?.to_string())
            .args(["--label", "Arch Linux Limine Bootloader", "--loader"])
            .arg(loader)
            .args(["--unicode", "--verbose"]);
        ctx.host.runner.run(&cmd)?;
    }

    Ok((config_path, hook))
}

fn install_bios(ctx: &BootContext<'_>) -> Result<(PathBuf, String)> {
    let boot_limine = ctx.target.join("boot/limine");
    let parent = ctx.parent_disk(ctx.boot)?;

    copy_files(&ctx.target.join(LIMINE_SHARE), &boot_limine, &["limine-bios.sys"])
        .map_err(|e| InstallError::disk(format!("failed to install Limine on {}", parent.display()), e))?;
    ctx.host
        .runner
        .run(&ctx.chroot("limine").arg("bios-install").path_arg(&parent))
        .map_err(|e| InstallError::disk(format!("failed to install Limine on {}", parent.display()), e))?;

    let hook = format!(
        "/usr/bin/limine bios-install {} && /usr/bin/cp /usr/share/limine/limine-bios.sys /boot/limine/",
        parent.display()
    );
    Ok((boot_limine.join("limine.conf"), hook))
}

pub(super) fn install(ctx: &BootContext<'_>) -> Result<()> {
    debug!("Installing Limine bootloader");
    ctx.strap(&["limine"])?;
    info!("Limine boot partition: {}", ctx.boot.describe());

    let (config_path, hook) = if ctx.uefi() {
        install_uefi(ctx)?
    } else {
        install_bios(ctx)?
    };

    write_pacman_hook(
        ctx.target,
        "99-limine.hook",
        "limine",
        "Deploying Limine after upgrade...",
        &format!("/bin/sh -c \"{hook}\""),
    )?;

    let path_root = if ctx.efi.is_some() && !ctx.boot_is_efi() {
        let partuuid = ctx.boot.partuuid.as_deref().ok_or_else(|| {
            InstallError::Disk(format!("PARTUUID of {} is unknown", ctx.boot.describe()))
        })?;
        format!("uuid({partuuid})")
    } else {
        "boot()".to_string()
    };

    let cmdline = ctx.params(RootIdentity::PartUuid).join(" ");
    fs::write(
        &config_path,
        limine_conf(ctx.kernels, &cmdline, &path_root, ctx.config.uki),
    )?;
    Ok(())
}
