// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use super::BootContext;
use crate::cmdline::RootIdentity;
use crate::error::{InstallError, Result};

const GRUB_DEFAULT: &str = "etc/default/grub";

const UKI_SCRIPT: &str = "#! /bin/sh\n\
set -e\n\
\n\
cat << EOF\n\
if [ \"\\$grub_platform\" = \"efi\" ]; then\n\
  uki\n\
fi\n\
EOF\n";

/// Uncomment `GRUB_ENABLE_CRYPTODISK=y` so the core image embeds the crypto modules
pub fn enable_cryptodisk(config: &str) -> String {
    rewrite_lines(config, |line| {
        line.strip_prefix("#GRUB_ENABLE_CRYPTODISK=y")
            .map(|rest| format!("GRUB_ENABLE_CRYPTODISK=y{rest}"))
    })
}

/// Fill an empty `GRUB_CMDLINE_LINUX=""`; a populated one is left alone
pub fn set_grub_cmdline(config: &str, params: &[String]) -> String {
    let mut done = false;
    rewrite_lines(config, |line| {
        if done || line != "GRUB_CMDLINE_LINUX=\"\"" {
            return None;
        }
        done = true;
        Some(format!("GRUB_CMDLINE_LINUX=\"{}\"", params.join(" ")))
    })
}

fn rewrite_lines(config: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
    let mut out: Vec<String> = config
        .lines()
        .map(|line| f(line).unwrap_or_else(|| line.to_string()))
        .collect();
    if config.ends_with('\n') {
        out.push(String::new());
    }
    out.join("\n")
}

/// Swap the `10_linux` generator for one listing the UKIs
fn enable_uki_entries(target: &Path) -> std::io::Result<()> {
    let grub_d = target.join("etc/grub.d");
    let linux = grub_d.join("10_linux");
    let mode = fs::metadata(&linux)?.permissions().mode();

    fs::set_permissions(&linux, fs::Permissions::from_mode(mode & !0o111))?;
    let uki = grub_d.join("15_uki");
    fs::write(&uki, UKI_SCRIPT)?;
    fs::set_permissions(&uki, fs::Permissions::from_mode(mode))?;
    Ok(())
}

pub(super) fn install(ctx: &BootContext<'_>) -> Result<()> {
    debug!("Installing grub bootloader");
    ctx.strap(&["grub"])?;

    let grub_default = ctx.target.join(GRUB_DEFAULT);
    if ctx.layout.encryption().is_encrypted() {
        let config = fs::read_to_string(&grub_default)?;
        fs::write(&grub_default, enable_cryptodisk(&config))?;
    }

    info!("GRUB boot partition: {}", ctx.boot.describe());
    let mut boot_dir = PathBuf::from("/boot");
    let mut cmd = ctx.chroot("grub-install").arg("--debug");

    if ctx.uefi() {
        let (efi, efi_mountpoint) = ctx.require_efi()?;
        info!("GRUB EFI partition: {}", efi.describe());
        ctx.strap(&["efibootmgr"])?;

        cmd = cmd
            .arg(format!("--target={}", ctx.host.firmware.grub_target()))
            .arg(format!("--efi-directory={}", efi_mountpoint.display()));
        if let Some(mountpoint) = &ctx.boot.mountpoint
            && *mountpoint != boot_dir
        {
            cmd = cmd.arg(format!("--boot-directory={}", mountpoint.display()));
            boot_dir = mountpoint.clone();
        }
        cmd = cmd.arg("--bootloader-id=GRUB");
        if ctx.config.removable {
            cmd = cmd.arg("--removable");
        }

        ctx.host.runner.run(&cmd).map_err(|e| {
            InstallError::disk(
                format!("could not install GRUB to {}", ctx.in_target(efi_mountpoint).display()),
                e,
            )
        })?;
    } else {
        let parent = ctx.parent_disk(ctx.boot)?;
        let cmd = cmd.args(["--target=i386-pc", "--recheck"]).path_arg(&parent);
        ctx.host.runner.run(&cmd).map_err(|e| {
            InstallError::disk(format!("failed to install GRUB boot code on {}", parent.display()), e)
        })?;
    }

    if ctx.uefi() && ctx.config.uki {
        if let Err(e) = enable_uki_entries(ctx.target) {
            error!("Failed to enable UKI menu entries: {e}");
        }
    } else {
        let config = fs::read_to_string(&grub_default)?;
        let params = ctx.params(RootIdentity::Omit);
        fs::write(&grub_default, set_grub_cmdline(&config, &params))?;
    }

    ctx.host
        .runner
        .run(
            &ctx.chroot("grub-mkconfig")
                .arg("-o")
                .path_arg(&boot_dir.join("grub/grub.cfg")),
        )
        .map_err(|e| InstallError::disk("could not configure GRUB", e))?;
    Ok(())
}
