// SPDX-License-Identifier: GPL-3.0-only

//! Unattended installer front end
//!
//! Reads a plan file and runs one installation session against it, or tears
//! a previous target down again with `rescue`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use installer_core::planner::{
    DEFAULT_VG_NAME, DEFAULT_ZFS_POOL, DEFAULT_ZFS_PREFIX, LayoutOptions, Unattended,
    suggest_lvm_layout, suggest_single_disk_layout, suggest_zfs_layout,
};
use installer_core::{Host, ReadinessOptions, perform_installation, teardown};
use installer_sys::{
    CommandRunner, CpuVendor, DeviceQuery, DryRunRunner, Firmware, LsblkDevices, Pacstrap,
    SystemClock, SystemRunner, cpuinfo, require_tool,
};
use installer_types::{
    Bootloader, DiskEncryption, DiskLayoutConfiguration, DiskLayoutType, EncryptionType,
    FilesystemType, InstallPlan, Password,
};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable the `suggest` subcommand reads the LUKS passphrase from
const PASSWORD_ENV: &str = "INSTALLER_PASSWORD";

/// Live environment tools every installation calls
const REQUIRED_TOOLS: [&str; 5] = ["lsblk", "sfdisk", "pacstrap", "arch-chroot", "genfstab"];

/// Exit status of a session that ran to the end but left mandatory steps undone
const INCOMPLETE: u8 = 2;

#[derive(Parser)]
#[command(name = "installer")]
#[command(about = "Install Arch Linux onto a disk from a plan file", long_about = None)]
#[command(version)]
struct Cli {
    /// Plan file (TOML, or JSON with a .json extension)
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Directory the new system is mounted under
    #[arg(long, default_value = "/mnt")]
    target: PathBuf,

    /// Log the command sequence instead of running it
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for NTP time synchronization
    #[arg(long)]
    skip_ntp: bool,

    /// Do not wait for the keyring WKD sync
    #[arg(long)]
    skip_wkd: bool,

    /// No network available; skip mirror selection
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Unmount the target and close every container the plan describes
    Rescue,

    /// Print a suggested plan for a whole disk
    Suggest {
        /// Disk to partition; everything on it is lost when the plan runs
        device: PathBuf,

        #[arg(long, value_enum, default_value_t = FsArg::Ext4)]
        filesystem: FsArg,

        #[arg(long, value_enum, default_value_t = EncryptArg::None)]
        encryption: EncryptArg,

        #[arg(long, value_enum, default_value_t = BootArg::Systemd)]
        bootloader: BootArg,

        /// Put root and home on logical volumes
        #[arg(long)]
        lvm: bool,

        /// One root partition instead of separate root and home
        #[arg(long)]
        no_home: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FsArg {
    Btrfs,
    Ext4,
    Xfs,
    F2fs,
    Zfs,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EncryptArg {
    None,
    Luks,
    LvmOnLuks,
    LuksOnLvm,
}

#[derive(Clone, Copy, ValueEnum)]
enum BootArg {
    None,
    Systemd,
    Grub,
    Limine,
    Efistub,
    Refind,
}

impl From<BootArg> for Bootloader {
    fn from(arg: BootArg) -> Self {
        match arg {
            BootArg::None => Bootloader::NoBootloader,
            BootArg::Systemd => Bootloader::Systemd,
            BootArg::Grub => Bootloader::Grub,
            BootArg::Limine => Bootloader::Limine,
            BootArg::Efistub => Bootloader::Efistub,
            BootArg::Refind => Bootloader::Refind,
        }
    }
}

fn main() -> Result<ExitCode> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("installer=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Suggest {
            device,
            filesystem,
            encryption,
            bootloader,
            lvm,
            no_home,
        }) => {
            let opts = SuggestOptions {
                filesystem: *filesystem,
                encryption: *encryption,
                bootloader: (*bootloader).into(),
                lvm: *lvm,
                separate_home: !no_home,
            };
            let plan = suggest(device, &opts)?;
            print!("{}", plan.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Rescue) => {
            let plan = load_plan(&cli)?;
            require_root(&cli)?;
            with_host(&cli, |host| rescue(host, &cli.target, &plan))
        }
        None => {
            let plan = load_plan(&cli)?;
            require_root(&cli)?;
            if !cli.dry_run {
                for tool in REQUIRED_TOOLS {
                    require_tool(tool)?;
                }
            }
            with_host(&cli, |host| install(host, &cli, &plan))
        }
    }
}

fn load_plan(cli: &Cli) -> Result<InstallPlan> {
    let Some(path) = &cli.plan else {
        bail!("--plan is required");
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    InstallPlan::from_str_with_path(&content, path)
        .with_context(|| format!("Invalid plan {}", path.display()))
}

fn require_root(cli: &Cli) -> Result<()> {
    if cli.dry_run {
        return Ok(());
    }
    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("The installer must run as root");
        bail!("Installer must run with root privileges");
    }
    Ok(())
}

/// Build the host from the real system and hand it to `f`
///
/// A dry run records commands instead of running them; device queries are
/// read-only and still go to the real `lsblk`.
fn with_host<F>(cli: &Cli, f: F) -> Result<ExitCode>
where
    F: FnOnce(Host<'_>) -> Result<ExitCode>,
{
    let clock = SystemClock;
    let devices = LsblkDevices::new(SystemRunner);
    let firmware = Firmware::detect();
    tracing::info!("Firmware: {}", if firmware.uefi { "UEFI" } else { "BIOS" });
    let cpu = cpuinfo::cpu_vendor().unwrap_or_else(|err| {
        tracing::warn!("Could not read the CPU vendor: {err}");
        None
    });

    if cli.dry_run {
        let recorder = DryRunRunner::new();
        let result = run_with(&recorder, &devices, &clock, firmware, cpu, f);
        for command in recorder.recorded() {
            println!("{command}");
        }
        return result;
    }
    run_with(&SystemRunner, &devices, &clock, firmware, cpu, f)
}

fn run_with<F>(
    runner: &dyn CommandRunner,
    devices: &dyn DeviceQuery,
    clock: &SystemClock,
    firmware: Firmware,
    cpu: Option<CpuVendor>,
    f: F,
) -> Result<ExitCode>
where
    F: FnOnce(Host<'_>) -> Result<ExitCode>,
{
    let packages = Pacstrap::new(runner, clock);
    f(Host {
        runner,
        devices,
        packages: &packages,
        clock,
        firmware,
        cpu,
    })
}

fn install(host: Host<'_>, cli: &Cli, plan: &InstallPlan) -> Result<ExitCode> {
    let readiness = ReadinessOptions {
        skip_ntp: cli.skip_ntp || cli.dry_run,
        skip_wkd: cli.skip_wkd || cli.dry_run,
        offline: cli.offline || cli.dry_run,
    };

    // a dry run must not leave files in the real target
    let scratch;
    let target: &Path = if cli.dry_run {
        scratch = tempfile::tempdir().context("Failed to create a scratch target")?;
        scratch.path()
    } else {
        &cli.target
    };

    let report = perform_installation(host, target, plan, readiness)
        .with_context(|| format!("Installation into {} failed", cli.target.display()))?;

    if report.is_complete() {
        tracing::info!("Installation completed without errors");
        return Ok(ExitCode::SUCCESS);
    }
    tracing::warn!(
        "Installation finished, but these steps did not complete: {}",
        report.missing_steps().join(", ")
    );
    tracing::warn!("The system may not boot; inspect {} before rebooting", cli.target.display());
    Ok(ExitCode::from(INCOMPLETE))
}

fn rescue(host: Host<'_>, target: &Path, plan: &InstallPlan) -> Result<ExitCode> {
    let report = teardown(&host, target, &plan.disk_config);
    if report.failures > 0 {
        tracing::error!("Teardown of {} left {} step(s) undone", target.display(), report.failures);
        return Ok(ExitCode::FAILURE);
    }
    tracing::info!("Closed {}", report.closed.join(", "));
    Ok(ExitCode::SUCCESS)
}

struct SuggestOptions {
    filesystem: FsArg,
    encryption: EncryptArg,
    bootloader: Bootloader,
    lvm: bool,
    separate_home: bool,
}

fn suggest(device: &Path, opts: &SuggestOptions) -> Result<InstallPlan> {
    let firmware = Firmware::detect();
    let disk = LsblkDevices::new(SystemRunner)
        .info(device)
        .with_context(|| format!("Failed to query {}", device.display()))?
        .to_block_device();

    let fs = match opts.filesystem {
        FsArg::Zfs => None,
        FsArg::Btrfs => Some(FilesystemType::Btrfs),
        FsArg::Ext4 => Some(FilesystemType::Ext4),
        FsArg::Xfs => Some(FilesystemType::Xfs),
        FsArg::F2fs => Some(FilesystemType::F2fs),
    };
    let layout_opts = LayoutOptions {
        filesystem: fs,
        separate_home: Some(opts.separate_home),
        bootloader: opts.bootloader,
        ..LayoutOptions::default()
    };

    let mut layout = match fs {
        None => suggest_zfs_layout(&disk, firmware, DEFAULT_ZFS_POOL, DEFAULT_ZFS_PREFIX)?,
        Some(_) => {
            let dm = suggest_single_disk_layout(&disk, firmware, &layout_opts, &Unattended)?;
            DiskLayoutConfiguration::new(DiskLayoutType::Default, vec![dm])
        }
    };

    if opts.lvm && opts.encryption == EncryptArg::Luks {
        bail!("Encrypted LVM needs --encryption lvm-on-luks or luks-on-lvm");
    }
    let needs_lvm = matches!(opts.encryption, EncryptArg::LvmOnLuks | EncryptArg::LuksOnLvm);
    if (opts.lvm || needs_lvm) && fs.is_some() {
        layout.lvm_config = Some(suggest_lvm_layout(&layout, &layout_opts, &Unattended, DEFAULT_VG_NAME)?);
    }

    if opts.encryption != EncryptArg::None {
        layout.disk_encryption = Some(suggest_encryption(&layout, opts.encryption)?);
    }

    let mut plan = InstallPlan::new(layout);
    plan.bootloader_config.bootloader = opts.bootloader;
    plan.validate()?;
    Ok(plan)
}

fn suggest_encryption(layout: &DiskLayoutConfiguration, encryption: EncryptArg) -> Result<DiskEncryption> {
    if layout.zfs_config.is_some() {
        bail!("ZFS layouts use native encryption, not LUKS");
    }
    let password = std::env::var(PASSWORD_ENV)
        .with_context(|| format!("Set {PASSWORD_ENV} to the passphrase for the encrypted containers"))?;

    let data_partitions = layout
        .partitions()
        .filter(|p| !p.is_efi() && !p.is_boot() && !p.is_bios_grub())
        .map(|p| p.obj_id);
    let volumes = layout
        .lvm_config
        .iter()
        .flat_map(|lvm| lvm.volumes())
        .map(|v| v.obj_id);

    let encryption_type = match encryption {
        EncryptArg::None => EncryptionType::NoEncryption,
        EncryptArg::Luks => EncryptionType::Luks,
        EncryptArg::LvmOnLuks => EncryptionType::LvmOnLuks,
        EncryptArg::LuksOnLvm => EncryptionType::LuksOnLvm,
    };
    Ok(DiskEncryption::new(
        encryption_type,
        Some(Password::new(password)),
        data_partitions,
        volumes,
    )?)
}
