// SPDX-License-Identifier: GPL-3.0-only

//! Unified kernel image preparation
//!
//! mkinitcpio builds the images itself once the presets point at the ESP;
//! this module only writes the command line and rewrites the presets.

use std::fs;
use std::path::Path;

use installer_types::device::strip_root;
use tracing::{debug, info};

use crate::error::Result;

const DEFAULT_ESP: &str = "/efi";

/// `/etc/kernel/cmdline` contents
pub fn write_cmdline(target: &Path, params: &[String]) -> Result<()> {
    let path = target.join("etc/kernel/cmdline");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, format!("{}\n", params.join(" ")))?;
    Ok(())
}

/// os-release copy whose `PRETTY_NAME` names the kernel variant
pub fn kernel_os_release(base: &str, kernel: &str) -> String {
    let mut replaced = false;
    let mut out: Vec<String> = base
        .lines()
        .map(|line| {
            if !replaced && line.starts_with("PRETTY_NAME=") {
                replaced = true;
                format!("PRETTY_NAME=\"Arch Linux ({kernel})\"")
            } else {
                line.to_string()
            }
        })
        .collect();
    if base.ends_with('\n') {
        out.push(String::new());
    }
    out.join("\n")
}

/// Rewritten preset plus the image paths it no longer produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetRewrite {
    pub content: String,
    pub dropped_images: Vec<String>,
}

/// Switch a kernel preset from initramfs images to a UKI on the ESP
///
/// `*_image=` lines are commented out, `#*_uki=` lines are enabled with the
/// leading directory swapped for `esp` when it is not `/efi`, and
/// `default_options` gains `--osrelease`.
pub fn rewrite_preset(content: &str, kernel: &str, esp: &Path) -> PresetRewrite {
    let esp = esp.display().to_string();
    let mut dropped_images = Vec::new();

    let lines = content.split_inclusive('\n').map(|line| {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };

        if !body.starts_with('#')
            && let Some(at) = body.find("_image=\"/")
        {
            let path = &body[at + "_image=\"/".len()..];
            if let Some(end) = path.find('"') {
                dropped_images.push(path[..end].to_string());
            }
            return format!("#{body}{newline}");
        }

        if let Some(uncommented) = body.strip_prefix('#')
            && let Some(at) = uncommented.find("_uki=\"/")
        {
            if esp == DEFAULT_ESP {
                return format!("{uncommented}{newline}");
            }
            let key_end = at + "_uki=\"".len();
            let rest = &uncommented[key_end + 1..];
            let rest = rest.find('/').map_or(rest, |slash| &rest[slash..]);
            return format!("{}{esp}{rest}{newline}", &uncommented[..key_end]);
        }

        if let Some(options) = body.strip_prefix("#default_options=") {
            let options = options.trim_end_matches('"');
            return format!(
                "default_options={options} --osrelease /etc/os-release.d/{kernel}\"{newline}"
            );
        }

        line.to_string()
    });

    let content = lines.collect();
    PresetRewrite {
        content,
        dropped_images,
    }
}

/// Prepare the target for UKIs; the caller regenerates the initramfs afterwards
pub fn configure_uki(
    target: &Path,
    esp_mountpoint: &Path,
    kernels: &[String],
    params: &[String],
) -> Result<()> {
    info!("Configuring unified kernel images on {}", esp_mountpoint.display());
    write_cmdline(target, params)?;

    let release_dir = target.join("etc/os-release.d");
    fs::create_dir_all(&release_dir)?;
    let base_release = fs::read_to_string(target.join("etc/os-release"))?;

    for kernel in kernels {
        fs::write(release_dir.join(kernel), kernel_os_release(&base_release, kernel))?;

        let preset = target.join("etc/mkinitcpio.d").join(format!("{kernel}.preset"));
        let rewrite = rewrite_preset(&fs::read_to_string(&preset)?, kernel, esp_mountpoint);
        for image in &rewrite.dropped_images {
            let image = target.join(image);
            if image.exists() {
                debug!("Removing {}", image.display());
                fs::remove_file(&image)?;
            }
        }
        fs::write(&preset, rewrite.content)?;
    }

    fs::create_dir_all(target.join(strip_root(esp_mountpoint)).join("EFI/Linux"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESET: &str = r#"# mkinitcpio preset file for the 'linux' package

ALL_kver="/boot/vmlinuz-linux"

PRESETS=('default' 'fallback')

#default_config="/etc/mkinitcpio.conf"
default_image="/boot/initramfs-linux.img"
#default_uki="/efi/EFI/Linux/arch-linux.efi"
#default_options="--splash /usr/share/systemd/bootctl/splash-arch.bmp"

#fallback_config="/etc/mkinitcpio.conf"
fallback_image="/boot/initramfs-linux-fallback.img"
#fallback_uki="/efi/EFI/Linux/arch-linux-fallback.efi"
fallback_options="-S autodetect"
"#;

    #[test]
    fn preset_switches_to_uki_on_default_esp() {
        let rewrite = rewrite_preset(PRESET, "linux", Path::new("/efi"));
        assert_eq!(
            rewrite.dropped_images,
            vec!["boot/initramfs-linux.img", "boot/initramfs-linux-fallback.img"]
        );
        let content = rewrite.content;
        assert!(content.contains("\n#default_image=\"/boot/initramfs-linux.img\"\n"));
        assert!(content.contains("\ndefault_uki=\"/efi/EFI/Linux/arch-linux.efi\"\n"));
        assert!(content.contains(
            "\ndefault_options=\"--splash /usr/share/systemd/bootctl/splash-arch.bmp --osrelease /etc/os-release.d/linux\"\n"
        ));
        assert!(content.contains("\n#default_config=\"/etc/mkinitcpio.conf\"\n"));
        assert!(content.contains("\nfallback_options=\"-S autodetect\"\n"));
    }

    #[test]
    fn preset_follows_other_esp_mountpoints() {
        let rewrite = rewrite_preset(PRESET, "linux", Path::new("/boot"));
        assert!(rewrite.content.contains("\ndefault_uki=\"/boot/EFI/Linux/arch-linux.efi\"\n"));
        assert!(rewrite.content.contains("\nfallback_uki=\"/boot/EFI/Linux/arch-linux-fallback.efi\"\n"));
    }

    #[test]
    fn os_release_names_the_kernel() {
        let base = "NAME=\"Arch Linux\"\nPRETTY_NAME=\"Arch Linux\"\nID=arch\n";
        assert_eq!(
            kernel_os_release(base, "linux-lts"),
            "NAME=\"Arch Linux\"\nPRETTY_NAME=\"Arch Linux (linux-lts)\"\nID=arch\n"
        );
    }

    #[test]
    fn configure_writes_cmdline_and_presets() {
        let target = tempfile::tempdir().unwrap();
        let root = target.path();
        fs::create_dir_all(root.join("etc/mkinitcpio.d")).unwrap();
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::write(root.join("etc/os-release"), "PRETTY_NAME=\"Arch Linux\"\n").unwrap();
        fs::write(root.join("etc/mkinitcpio.d/linux.preset"), PRESET).unwrap();
        fs::write(root.join("boot/initramfs-linux.img"), b"old").unwrap();

        configure_uki(root, Path::new("/efi"), &["linux".into()], &["rw".into(), "quiet".into()]).unwrap();

        assert_eq!(fs::read_to_string(root.join("etc/kernel/cmdline")).unwrap(), "rw quiet\n");
        assert!(!root.join("boot/initramfs-linux.img").exists());
        assert!(root.join("efi/EFI/Linux").is_dir());
        assert_eq!(
            fs::read_to_string(root.join("etc/os-release.d/linux")).unwrap(),
            "PRETTY_NAME=\"Arch Linux (linux)\"\n"
        );
    }
}
