// SPDX-License-Identifier: GPL-3.0-only

use std::fs;

use tracing::{debug, warn};

use super::BootContext;
use crate::cmdline::RootIdentity;
use crate::error::Result;

/// First systemd release whose `bootctl` takes `--variables=BOOL`
const VARIABLES_FLAG_SINCE: u32 = 258;

/// Major version from `pacman -Q systemd` output such as `systemd 258.1-1`
fn parse_systemd_version(output: &str) -> Option<u32> {
    let version = output.split_whitespace().nth(1)?;
    version
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

/// Set `default` and enable a commented `timeout`, leaving other lines alone
pub fn update_loader_conf(existing: Option<&str>, default_entry: &str) -> String {
    let default = format!("default {default_entry}");
    let lines: Vec<String> = match existing {
        None => vec![default, "timeout 15".into()],
        Some(content) => content
            .lines()
            .map(|line| {
                if line.starts_with("default") {
                    default.clone()
                } else if let Some(timeout) = line.strip_prefix("#timeout") {
                    format!("timeout{timeout}")
                } else {
                    line.to_string()
                }
            })
            .collect(),
    };
    lines.join("\n") + "\n"
}

pub fn loader_entry(kernel: &str, options: &str) -> String {
    format!(
        "# Created by: installer\n\
         title   Arch Linux ({kernel})\n\
         linux   /vmlinuz-{kernel}\n\
         initrd  /initramfs-{kernel}.img\n\
         options {options}\n"
    )
}

fn bootctl_install(ctx: &BootContext<'_>, flag: Option<&str>, options: &[String]) -> Result<()> {
    let mut cmd = ctx.chroot("bootctl");
    if let Some(flag) = flag {
        cmd = cmd.arg(flag);
    }
    ctx.host.runner.run(&cmd.args(options.iter().cloned()).arg("install"))?;
    Ok(())
}

pub(super) fn install(ctx: &BootContext<'_>) -> Result<()> {
    debug!("Installing systemd bootloader");
    ctx.strap(&["efibootmgr"])?;

    let (_, efi_mountpoint) = ctx.require_efi()?;
    let boot_mountpoint = ctx.boot_mountpoint()?;

    let mut options = Vec::new();
    if !ctx.boot_is_efi() {
        options.push(format!("--esp-path={}", efi_mountpoint.display()));
        options.push(format!("--boot-path={}", boot_mountpoint.display()));
    }

    let version = ctx
        .host
        .runner
        .output(&ctx.chroot("pacman").args(["-Q", "systemd"]))
        .ok()
        .and_then(|out| parse_systemd_version(&out));
    debug!("systemd version in target: {version:?}");

    // bootctl skips EFI variables when it detects a container, as arch-chroot looks like one
    let (flag, fallback) = if version.is_some_and(|v| v >= VARIABLES_FLAG_SINCE) {
        (Some("--variables=yes"), "--variables=no")
    } else {
        (None, "--no-variables")
    };
    if let Err(e) = bootctl_install(ctx, flag, &options) {
        warn!("bootctl install failed ({e}), retrying without EFI variables");
        bootctl_install(ctx, Some(fallback), &options)?;
    }

    let default_kernel = ctx.kernels.first().map(String::as_str).unwrap_or("linux");
    let default_entry = if ctx.config.uki {
        format!("arch-{default_kernel}.efi")
    } else {
        let entries = ctx.in_target(boot_mountpoint).join("loader/entries");
        fs::create_dir_all(&entries)?;
        let options = ctx.params(RootIdentity::PartUuid).join(" ");
        for kernel in ctx.kernels {
            fs::write(entries.join(format!("arch_{kernel}.conf")), loader_entry(kernel, &options))?;
        }
        format!("arch_{default_kernel}.conf")
    };

    let loader_conf = ctx.in_target(efi_mountpoint).join("loader/loader.conf");
    if let Some(parent) = loader_conf.parent() {
        fs::create_dir_all(parent)?;
    }
    let existing = fs::read_to_string(&loader_conf).ok();
    fs::write(&loader_conf, update_loader_conf(existing.as_deref(), &default_entry))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use installer_sys::{CommandOutput, Firmware};
    use installer_types::{Bootloader, FilesystemType};

    use super::super::fixtures::{Fixture, config};
    use super::super::install_bootloader;
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_systemd_version("systemd 258.1-1"), Some(258));
        assert_eq!(parse_systemd_version("systemd 257.8-2\n"), Some(257));
        assert_eq!(parse_systemd_version("error: package not found"), None);
    }

    #[test]
    fn loader_conf_keeps_unrelated_lines() {
        let existing = "#timeout 3\n#console-mode keep\ndefault old.conf\n";
        assert_eq!(
            update_loader_conf(Some(existing), "arch_linux.conf"),
            "timeout 3\n#console-mode keep\ndefault arch_linux.conf\n"
        );
        assert_eq!(
            update_loader_conf(None, "arch-linux.efi"),
            "default arch-linux.efi\ntimeout 15\n"
        );
    }

    #[test]
    fn writes_entries_on_the_esp() {
        let fx = Fixture::new("/boot", None);
        let ctx = fx.context(Firmware::UEFI64, config(Bootloader::Systemd));
        install_bootloader(&ctx).unwrap();

        assert_eq!(fx.packages.installed(), vec!["efibootmgr"]);
        let bootctl = format!("arch-chroot {} bootctl install", fx.target.path().display());
        assert_eq!(fx.runner.count(&bootctl), 1);

        let entry = fx.read("boot/loader/entries/arch_linux.conf");
        assert!(entry.contains("linux   /vmlinuz-linux\n"));
        assert!(entry.contains("options root=PARTUUID=puuid-3 rw rootfstype=ext4\n"));
        assert_eq!(fx.read("boot/loader/loader.conf"), "default arch_linux.conf\ntimeout 15\n");
    }

    #[test]
    fn new_bootctl_falls_back_without_variables() {
        let mut fx = Fixture::new("/efi", Some(FilesystemType::Ext4));
        let chroot = format!("arch-chroot {}", fx.target.path().display());
        fx.runner = installer_sys::testing::ScriptedRunner::new()
            .respond(&format!("{chroot} pacman -Q systemd"), CommandOutput::stdout("systemd 258.2-1\n"))
            .fail_once(&format!("{chroot} bootctl --variables=yes"), 1, "no efivars");

        let ctx = fx.context(Firmware::UEFI64, config(Bootloader::Systemd));
        install_bootloader(&ctx).unwrap();

        let rendered = fx.runner.rendered();
        assert!(rendered.contains(&format!(
            "{chroot} bootctl --variables=no --esp-path=/efi --boot-path=/boot install"
        )));
        assert!(fx.path("boot/loader/entries/arch_linux.conf").exists());
        assert!(fx.path("efi/loader/loader.conf").exists());
    }

    #[test]
    fn uki_skips_entries() {
        let fx = Fixture::new("/efi", None);
        let mut requested = config(Bootloader::Systemd);
        requested.uki = true;
        let ctx = fx.context(Firmware::UEFI64, requested);
        install_bootloader(&ctx).unwrap();

        assert!(!fx.path("efi/loader/entries").exists());
        assert_eq!(fx.read("efi/loader/loader.conf"), "default arch-linux.efi\ntimeout 15\n");
    }
}
