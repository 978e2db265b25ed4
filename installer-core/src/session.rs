// SPDX-License-Identifier: GPL-3.0-only

//! One installation, from plan to a target that boots
//!
//! Steps run strictly in order and the first error ends the session where it
//! stands. Nothing is unmounted or locked on failure; tearing the target down
//! is the separate [`crate::rescue`] operation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use installer_sys::{Cmd, meminfo, zfs};
use installer_types::{
    Bootloader, BootloaderConfiguration, ConsoleConfig, DiskLayoutConfiguration, DiskLayoutType,
    EncryptionType, FilesystemType, InstallPlan, ZramAlgorithm,
};
use tracing::{debug, error, info, warn};

use crate::apply::apply_layout;
use crate::bootloader::{BootContext, install_bootloader};
use crate::cmdline::{RootIdentity, kernel_params, resolve_root};
use crate::error::{InstallError, Result};
use crate::host::Host;
use crate::initramfs::Initramfs;
use crate::keyfile::{KeyfileReport, generate_key_files};
use crate::mount::{MountState, mount_ordered_layout};
use crate::premount::detect_premounted_layout;
use crate::readiness::{ReadinessOptions, WaitOutcome, sanity_check};
use crate::rescue::release;
use crate::uki::configure_uki;
use crate::validation::validate_bootloader;

const BASE_PACKAGES: [&str; 2] = ["base", "linux-firmware"];

/// Smallest `/boot` a bootloader and one kernel fit on
pub const MIN_BOOT_SIZE: u64 = 200 * 1024 * 1024;

const ZRAM_MIN_MIB: u64 = 4096;

/// What a finished session got done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub target: PathBuf,

    /// Base system strapped and configured
    pub base: bool,

    /// Last initramfs generation succeeded
    pub initramfs: bool,

    pub bootloader_requested: Bootloader,

    /// Loader that was actually installed
    pub bootloader: Option<Bootloader>,
    pub keyfiles: KeyfileReport,

    /// NTP, mirror selection and keyring waits, in that order
    pub readiness: [WaitOutcome; 3],
}

impl InstallReport {
    fn new(target: PathBuf, bootloader_requested: Bootloader) -> Self {
        Self {
            target,
            base: false,
            initramfs: false,
            bootloader_requested,
            bootloader: None,
            keyfiles: KeyfileReport::default(),
            readiness: [WaitOutcome::Skipped; 3],
        }
    }

    /// Mandatory steps that did not complete
    pub fn missing_steps(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.base {
            missing.push("base");
        }
        if !self.initramfs {
            missing.push("initramfs");
        }
        if self.bootloader_requested != Bootloader::NoBootloader && self.bootloader.is_none() {
            missing.push("bootloader");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_steps().is_empty()
    }
}

/// `/etc/systemd/zram-generator.conf` sized to half the RAM, at least 4 GiB
pub fn zram_generator_conf(ram_kb: u64, algorithm: ZramAlgorithm) -> String {
    let size_mb = (ram_kb / 2048).max(ZRAM_MIN_MIB);
    format!(
        "[zram0]\nzram-size = {size_mb}\ncompression-algorithm = {}\n",
        algorithm.as_str()
    )
}

pub fn vconsole_conf(console: &ConsoleConfig) -> String {
    let mut content = format!("KEYMAP={}\n", console.keymap);
    if let Some(font) = &console.font {
        content.push_str(&format!("FONT={font}\n"));
    }
    content
}

/// State of an installation into `target`
pub struct Installation<'h> {
    host: Host<'h>,
    target: PathBuf,
    layout: DiskLayoutConfiguration,
    kernels: Vec<String>,
    initramfs: Initramfs,
    base_packages: Vec<String>,
    disable_fstrim: bool,
    zram_enabled: bool,
    mounts: MountState<'h>,
    report: InstallReport,
}

impl<'h> Installation<'h> {
    pub fn new(
        host: Host<'h>,
        target: impl Into<PathBuf>,
        layout: DiskLayoutConfiguration,
        kernels: &[String],
        bootloader: Bootloader,
    ) -> Self {
        let target = target.into();
        let mut base_packages: Vec<String> = BASE_PACKAGES.iter().map(|p| p.to_string()).collect();
        base_packages.extend(kernels.iter().cloned());

        Self {
            host,
            report: InstallReport::new(target.clone(), bootloader),
            target,
            layout,
            kernels: kernels.to_vec(),
            initramfs: Initramfs::default(),
            base_packages,
            disable_fstrim: false,
            zram_enabled: false,
            mounts: MountState::new(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn layout(&self) -> &DiskLayoutConfiguration {
        &self.layout
    }

    pub fn mount_ordered_layout(&mut self) -> Result<()> {
        mount_ordered_layout(self.host.runner, &self.target, &self.layout, &mut self.mounts)
    }

    /// Readiness waits, then the `/boot` size check
    ///
    /// Runs after mounting so pre-mounted layouts that skipped planning are
    /// checked as well.
    pub fn sanity_check(&mut self, options: ReadinessOptions) -> Result<()> {
        self.report.readiness = sanity_check(&self.host, options);
        self.verify_boot_part()
    }

    fn verify_boot_part(&self) -> Result<()> {
        let boot_mount = self.target.join("boot");
        if let Some(info) = self.host.devices.find_by_mountpoint(&boot_mount)?
            && info.size < MIN_BOOT_SIZE
        {
            return Err(InstallError::Disk(format!(
                "The boot partition mounted at {} is not large enough to install a boot loader. \
                 Please resize it to at least 200MiB and re-run the installation.",
                boot_mount.display()
            )));
        }
        Ok(())
    }

    pub fn generate_key_files(&mut self) -> Result<()> {
        let report = generate_key_files(self.host.runner, &self.target, &self.layout, &mut self.initramfs)?;
        info!("Created {} keyfile(s)", report.keyfiles.len());
        self.report.keyfiles = report;
        Ok(())
    }

    pub fn enable_service(&self, service: &str) -> Result<()> {
        info!("Enabling service {service}");
        let cmd = Cmd::new("systemctl")
            .arg(format!("--root={}", self.target.display()))
            .arg("enable")
            .arg(service);
        self.host
            .runner
            .run(&cmd)
            .map_err(|e| InstallError::Service(format!("Unable to start service {service}: {e}")))?;
        Ok(())
    }

    fn strap(&self, packages: &[String]) -> Result<()> {
        self.host.packages.strap(&self.target, packages)?;
        Ok(())
    }

    pub fn add_additional_packages(&self, packages: &[String]) -> Result<()> {
        self.strap(packages)
    }

    fn add_base_package(&mut self, package: &str) {
        if !self.base_packages.iter().any(|p| p == package) {
            self.base_packages.push(package.to_string());
        }
    }

    fn prepare_fs_type(&mut self, fs_type: FilesystemType, mountpoint: Option<&Path>) {
        if let Some(package) = fs_type.installation_package() {
            self.add_base_package(package);
        }
        if let Some(module) = fs_type.initramfs_module() {
            self.initramfs.add_module(module);
        }
        // periodic TRIM on btrfs stalls the filesystem
        if fs_type == FilesystemType::Btrfs {
            self.disable_fstrim = true;
        }
        // there is no fsck for NTFS
        if fs_type == FilesystemType::Ntfs && mountpoint == Some(Path::new("/")) {
            self.initramfs.remove_hook("fsck");
        }
    }

    /// Packages and initramfs hooks the layout needs
    fn prepare_layout(&mut self) {
        let encryption = self.layout.encryption();
        let filesystems: Vec<(FilesystemType, Option<PathBuf>)> = self
            .layout
            .partitions()
            .filter_map(|p| p.fs_type.map(|fs| (fs, p.mountpoint.clone())))
            .chain(
                self.layout
                    .lvm_config
                    .iter()
                    .flat_map(|lvm| lvm.volumes())
                    .map(|v| (v.fs_type, v.mountpoint.clone())),
            )
            .collect();
        for (fs_type, mountpoint) in filesystems {
            self.prepare_fs_type(fs_type, mountpoint.as_deref());
        }

        if self.layout.lvm_config.is_some() {
            self.add_base_package("lvm2");
            self.initramfs.insert_hook_before("lvm2", "filesystems");
            if matches!(
                encryption.encryption_type(),
                EncryptionType::LvmOnLuks | EncryptionType::LuksOnLvm
            ) {
                self.initramfs.insert_hook_before("sd-encrypt", "lvm2");
            }
        } else if encryption.encryption_type() == EncryptionType::Luks {
            self.initramfs.insert_hook_before("sd-encrypt", "filesystems");
        }

        if self.layout.zfs_config.is_some() {
            self.add_base_package("zfs-utils");
            self.initramfs.insert_hook_before("zfs", "filesystems");
        }
    }

    fn set_vconsole(&mut self, console: &ConsoleConfig) -> Result<()> {
        let etc = self.target.join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("vconsole.conf"), vconsole_conf(console))?;
        info!("Wrote vconsole.conf using {}", console.keymap);

        // the live ISO has these fonts, the target only with the package
        if console.font.as_deref().is_some_and(|f| f.starts_with("ter-")) {
            self.add_base_package("terminus-font");
        }
        Ok(())
    }

    pub fn set_hostname(&self, hostname: &str) -> Result<()> {
        let etc = self.target.join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("hostname"), format!("{hostname}\n"))?;
        Ok(())
    }

    fn mkinitcpio(&mut self) {
        self.report.initramfs = self.initramfs.regenerate(self.host.runner, &self.target);
        if !self.report.initramfs {
            error!("Error generating initramfs (continuing anyway)");
        }
    }

    /// Strap and configure the base system
    ///
    /// `mkinitcpio` is false when unified kernel images are built later.
    pub fn minimal_installation(&mut self, plan: &InstallPlan, mkinitcpio: bool) -> Result<()> {
        self.prepare_layout();
        if let Some(console) = &plan.console {
            self.set_vconsole(console)?;
        }

        match self.host.cpu {
            Some(cpu) => self.add_base_package(cpu.microcode_package()),
            None => debug!("No microcode package for this CPU"),
        }
        self.strap(&self.base_packages)?;

        if self.layout.zfs_config.is_some() {
            zfs::zgenhostid(self.host.runner, Some(&self.target))?;
            for service in zfs::ZFS_SERVICES {
                self.enable_service(service)?;
            }
        }

        if !self.disable_fstrim {
            info!("Enabling periodic TRIM");
            self.enable_service("fstrim.timer")?;
        }

        self.set_hostname(&plan.hostname)?;

        let root_dir = self.target.join("root");
        if root_dir.exists() {
            fs::set_permissions(&root_dir, fs::Permissions::from_mode(0o700))?;
        } else {
            debug!("Root directory not found at {}, skipping chmod", root_dir.display());
        }

        if mkinitcpio {
            self.mkinitcpio();
        }
        self.report.base = true;
        Ok(())
    }

    pub fn setup_swap(&mut self, algorithm: ZramAlgorithm) -> Result<()> {
        info!("Setting up swap on zram");
        self.strap(&["zram-generator".to_string()])?;

        let ram_kb = meminfo::mem_total_kb().unwrap_or_else(|e| {
            warn!("Cannot read the memory size ({e}), using the minimum zram size");
            0
        });
        let conf = self.target.join("etc/systemd/zram-generator.conf");
        if let Some(parent) = conf.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&conf, zram_generator_conf(ram_kb, algorithm))?;
        info!("Zram compression algorithm: {}", algorithm.as_str());

        self.enable_service("systemd-zram-setup@zram0.service")?;
        self.zram_enabled = true;
        Ok(())
    }

    pub fn add_bootloader(&mut self, plan: &InstallPlan, config: BootloaderConfiguration) -> Result<()> {
        let root = resolve_root(&self.host, &self.layout)?;

        if config.uki && self.host.firmware.uefi {
            let esp_mountpoint = self
                .layout
                .efi_partition()
                .and_then(|p| p.mountpoint.clone())
                .ok_or_else(|| InstallError::Configuration("UKI needs a mounted EFI system partition".into()))?;
            let params = kernel_params(&root, RootIdentity::PartUuid, self.zram_enabled, &plan.kernel_params);
            configure_uki(&self.target, &esp_mountpoint, &self.kernels, &params)?;
            self.mkinitcpio();
        }

        let ctx = BootContext::new(
            self.host,
            &self.target,
            &self.layout,
            root,
            &self.kernels,
            &plan.kernel_params,
            self.zram_enabled,
            config,
        )?;
        install_bootloader(&ctx)?;
        self.report.bootloader = Some(config.bootloader);
        Ok(())
    }

    pub fn genfstab(&self) -> Result<()> {
        let fstab_path = self.target.join("etc/fstab");
        info!("Updating {}", fstab_path.display());

        let generated = self
            .host
            .runner
            .run(
                &Cmd::new("genfstab")
                    .args(["-pU", "-f"])
                    .path_arg(&self.target)
                    .path_arg(&self.target),
            )
            .map_err(|e| {
                InstallError::Requirement(format!(
                    "Could not generate fstab, strapping in packages most likely failed (disk out of space?): {e}"
                ))
            })?;

        if let Some(parent) = fstab_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut fstab = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&fstab_path)
            .map_err(|e| InstallError::Requirement(format!("Could not create fstab file: {e}")))?;
        fstab.write_all(generated.stdout.as_bytes())?;
        for entry in &self.mounts.fstab_entries {
            writeln!(fstab, "{entry}")?;
        }
        Ok(())
    }

    /// Unmount the target and lock what this session unlocked
    pub fn release(&mut self) -> Result<()> {
        release(&self.host, &self.target, &mut self.mounts)
    }

    /// Flush writes and summarise what got done
    pub fn finish(self) -> InstallReport {
        info!("Syncing the system...");
        if let Err(e) = self.host.runner.run(&Cmd::new("sync")) {
            warn!("sync failed: {e}");
        }

        let missing = self.report.missing_steps();
        if missing.is_empty() {
            info!(
                "Installation completed without any errors. You may reboot when ready."
            );
        } else {
            warn!("Some required steps were not successfully installed/configured before leaving the installer:");
            for step in &missing {
                warn!(" - {step}");
            }
        }
        self.report
    }
}

/// Run every step of `plan` against the disks and the target
pub fn perform_installation(
    host: Host<'_>,
    target: &Path,
    plan: &InstallPlan,
    readiness: ReadinessOptions,
) -> Result<InstallReport> {
    plan.validate()?;
    info!("Starting installation...");

    let premounted = plan.disk_config.config_type == DiskLayoutType::PreMount;
    let target = match (&plan.disk_config.mountpoint, premounted) {
        (Some(mountpoint), true) => mountpoint.clone(),
        _ => target.to_path_buf(),
    };

    let layout = if premounted {
        detect_premounted_layout(&host, &target)?
    } else {
        plan.disk_config.clone()
    };
    let config = validate_bootloader(host.firmware, &layout, plan.bootloader_config)?;

    let layout = if premounted {
        layout
    } else {
        apply_layout(&host, &layout)?
    };
    let encrypted = layout.encryption().is_encrypted();

    let mut installation = Installation::new(host, &target, layout, &plan.kernels, config.bootloader);
    if !premounted {
        installation.mount_ordered_layout()?;
    }
    installation.sanity_check(readiness)?;

    if !premounted && encrypted {
        installation.generate_key_files()?;
    }

    installation.minimal_installation(plan, !config.uki)?;

    if plan.swap.enabled {
        installation.setup_swap(plan.swap.algorithm)?;
    }

    if config.bootloader != Bootloader::NoBootloader {
        installation.add_bootloader(plan, config)?;
    }

    installation.add_additional_packages(&plan.packages)?;
    for service in &plan.services {
        installation.enable_service(service)?;
    }

    installation.genfstab()?;
    Ok(installation.finish())
}
