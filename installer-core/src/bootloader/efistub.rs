// SPDX-License-Identifier: GPL-3.0-only

use installer_sys::Cmd;
use tracing::debug;

use super::BootContext;
use crate::cmdline::RootIdentity;
use crate::error::Result;

/// One firmware boot entry per kernel pointing straight at the image
pub(super) fn install(ctx: &BootContext<'_>) -> Result<()> {
    debug!("Installing efistub bootloader");
    ctx.strap(&["efibootmgr"])?;

    let disk = ctx.parent_disk(ctx.boot)?;
    let partn = ctx.partn(ctx.boot)?;
    let params = ctx.params(RootIdentity::PartUuid);

    for kernel in ctx.kernels {
        let mut cmd = Cmd::new("efibootmgr")
            .arg("--create")
            .arg("--disk")
            .path_arg(&disk)
            .arg("--part")
            .arg(partn.to_string())
            .arg("--label")
            .arg(format!("Arch Linux ({kernel})"))
            .arg("--loader");

        if ctx.config.uki {
            cmd = cmd.arg(format!("/EFI/Linux/arch-{kernel}.efi")).arg("--unicode");
        } else {
            let mut cmdline = vec![format!("initrd=/initramfs-{kernel}.img")];
            cmdline.extend(params.iter().cloned());
            cmd = cmd
                .arg(format!("/vmlinuz-{kernel}"))
                .arg("--unicode")
                .arg(cmdline.join(" "));
        }

        ctx.host.runner.run(&cmd.arg("--verbose"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use installer_sys::Firmware;
    use installer_types::Bootloader;

    use super::super::fixtures::{Fixture, config};
    use super::super::install_bootloader;

    #[test]
    fn entry_per_kernel() {
        let mut fx = Fixture::new("/boot", None);
        fx.kernels = vec!["linux".into(), "linux-lts".into()];
        let ctx = fx.context(Firmware::UEFI64, config(Bootloader::Efistub));
        install_bootloader(&ctx).unwrap();

        assert_eq!(
            fx.runner.rendered(),
            vec![
                "efibootmgr --create --disk /dev/nvme0n1 --part 1 --label Arch Linux (linux) --loader /vmlinuz-linux --unicode initrd=/initramfs-linux.img root=PARTUUID=puuid-3 rw rootfstype=ext4 --verbose",
                "efibootmgr --create --disk /dev/nvme0n1 --part 1 --label Arch Linux (linux-lts) --loader /vmlinuz-linux-lts --unicode initrd=/initramfs-linux-lts.img root=PARTUUID=puuid-3 rw rootfstype=ext4 --verbose",
            ]
        );
        assert!(fx.packages.installed().contains(&"efibootmgr".to_string()));
    }

    #[test]
    fn uki_entries_have_no_inline_cmdline() {
        let fx = Fixture::new("/boot", None);
        let mut requested = config(Bootloader::Efistub);
        requested.uki = true;
        let ctx = fx.context(Firmware::UEFI64, requested);
        install_bootloader(&ctx).unwrap();

        assert_eq!(
            fx.runner.rendered(),
            vec!["efibootmgr --create --disk /dev/nvme0n1 --part 1 --label Arch Linux (linux) --loader /EFI/Linux/arch-linux.efi --unicode --verbose"]
        );
    }
}
