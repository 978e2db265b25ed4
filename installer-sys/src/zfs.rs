// SPDX-License-Identifier: GPL-3.0-only

//! ZFS pool and dataset tooling

use std::collections::BTreeSet;
use std::path::Path;

use installer_types::{ZfsDatasetConfig, ZfsPool};
use tracing::{debug, info};

use crate::command::{Cmd, CommandRunner};
use crate::{Result, SysError};

/// Pool creation options applied to every pool
pub const DEFAULT_POOL_OPTIONS: [&str; 18] = [
    "-o", "ashift=12",
    "-O", "acltype=posixacl",
    "-O", "relatime=on",
    "-O", "xattr=sa",
    "-o", "autotrim=on",
    "-O", "dnodesize=auto",
    "-O", "normalization=formD",
    "-O", "devices=off",
    "-m", "none",
];

/// Units enabled on the target so pools import and mount at boot
pub const ZFS_SERVICES: [&str; 5] = [
    "zfs.target",
    "zfs-import.target",
    "zfs-volumes.target",
    "zfs-import-scan.service",
    "zfs-zed.service",
];

/// Host id written by `zgenhostid`, must match between live and target
pub const HOST_ID: &str = "0x00bab10c";

fn ensure_enabled() -> Result<()> {
    if !cfg!(feature = "zfs-tools") {
        return Err(SysError::ToolMissing("zfs (zfs-tools feature disabled)".into()));
    }
    Ok(())
}

pub fn load_module(runner: &dyn CommandRunner) -> Result<()> {
    ensure_enabled()?;
    debug!("Loading ZFS kernel module");
    runner.run(&Cmd::new("modprobe").arg("zfs"))?;
    Ok(())
}

pub fn zpool_create(runner: &dyn CommandRunner, pool: &ZfsPool, device: &Path) -> Result<()> {
    ensure_enabled()?;
    info!("Creating ZFS pool {} on {}", pool.name, device.display());
    let cmd = Cmd::new("zpool")
        .args(["create", "-f"])
        .args(DEFAULT_POOL_OPTIONS)
        .args(["-O".to_string(), format!("compression={}", pool.compression)])
        .arg("-R")
        .path_arg(&pool.mountpoint)
        .arg(&pool.name)
        .path_arg(device);
    runner.run(&cmd)?;
    Ok(())
}

/// Import without mounting datasets, rooted at `altroot`
pub fn zpool_import(runner: &dyn CommandRunner, pool_name: &str, altroot: &Path) -> Result<()> {
    ensure_enabled()?;
    info!("Importing pool {pool_name} at {}", altroot.display());
    runner.run(
        &Cmd::new("zpool")
            .args(["import", "-N", "-R"])
            .path_arg(altroot)
            .arg(pool_name),
    )?;
    Ok(())
}

/// Unmount all datasets and export the pool
pub fn zpool_export(runner: &dyn CommandRunner, pool_name: &str) -> Result<()> {
    ensure_enabled()?;
    if let Err(e) = runner.run(&Cmd::new("zfs").args(["umount", "-a"])) {
        debug!("zfs umount -a: {e}");
    }
    runner.run(&Cmd::new("zpool").args(["export", pool_name]))?;
    Ok(())
}

pub fn zpool_set(runner: &dyn CommandRunner, pool_name: &str, prop: &str, value: &str) -> Result<()> {
    ensure_enabled()?;
    runner.run(&Cmd::new("zpool").args(["set".to_string(), format!("{prop}={value}"), pool_name.to_string()]))?;
    Ok(())
}

pub fn dataset_exists(runner: &dyn CommandRunner, full_name: &str) -> bool {
    runner.run(&Cmd::new("zfs").args(["list", full_name])).is_ok()
}

pub fn zfs_create(
    runner: &dyn CommandRunner,
    full_name: &str,
    properties: &[(String, String)],
) -> Result<()> {
    ensure_enabled()?;
    debug!("Creating dataset {full_name}");
    let mut cmd = Cmd::new("zfs").arg("create");
    for (key, value) in properties {
        cmd = cmd.args(["-o".to_string(), format!("{key}={value}")]);
    }
    runner.run(&cmd.arg(full_name))?;
    Ok(())
}

/// Create `<pool>/<prefix>` and every planned dataset, parents first
pub fn create_datasets(runner: &dyn CommandRunner, pool: &ZfsPool) -> Result<()> {
    let base = pool.base_dataset();
    if !dataset_exists(runner, &base) {
        zfs_create(runner, &base, &[("mountpoint".into(), "none".into())])?;
    }

    let mut datasets: Vec<&ZfsDatasetConfig> = pool.datasets.iter().collect();
    datasets.sort_by_key(|d| d.depth());
    let mut created = BTreeSet::new();

    for dataset in datasets {
        let parts: Vec<&str> = dataset.name.split('/').collect();
        for depth in 1..parts.len() {
            let parent = format!("{base}/{}", parts[..depth].join("/"));
            if !created.contains(&parent) && !dataset_exists(runner, &parent) {
                debug!("Creating parent dataset {parent}");
                zfs_create(runner, &parent, &[("mountpoint".into(), "none".into())])?;
            }
            created.insert(parent);
        }

        let mut props: Vec<(String, String)> = dataset
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(mp) = &dataset.mountpoint {
            props.push(("mountpoint".into(), mp.display().to_string()));
        }
        zfs_create(runner, &pool.full_name(dataset), &props)?;
    }
    Ok(())
}

pub fn zfs_mount(runner: &dyn CommandRunner, dataset: &str) -> Result<()> {
    ensure_enabled()?;
    runner.run(&Cmd::new("zfs").args(["mount", dataset]))?;
    Ok(())
}

/// Mount every dataset; failures are expected for datasets already mounted
pub fn zfs_mount_all(runner: &dyn CommandRunner) -> Result<()> {
    ensure_enabled()?;
    if let Err(e) = runner.run(&Cmd::new("zfs").args(["mount", "-a"])) {
        debug!("zfs mount -a: {e}");
    }
    Ok(())
}

pub fn zgenhostid(runner: &dyn CommandRunner, target: Option<&Path>) -> Result<()> {
    ensure_enabled()?;
    let cmd = match target {
        Some(target) => Cmd::chroot(target, "zgenhostid"),
        None => Cmd::new("zgenhostid"),
    };
    runner.run(&cmd.args(["-f", HOST_ID]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use installer_types::default_zfs_datasets;

    use super::*;
    use crate::testing::ScriptedRunner;

    fn pool() -> ZfsPool {
        ZfsPool {
            name: "zpool".into(),
            pvs: vec![],
            dataset_prefix: "arch".into(),
            datasets: default_zfs_datasets(),
            compression: "lz4".into(),
            mountpoint: PathBuf::from("/mnt"),
        }
    }

    #[test]
    fn pool_creation_carries_standard_options() {
        let runner = ScriptedRunner::new();
        zpool_create(&runner, &pool(), Path::new("/dev/sda2")).unwrap();
        let rendered = &runner.rendered()[0];
        assert!(rendered.starts_with("zpool create -f -o ashift=12 -O acltype=posixacl"));
        assert!(rendered.contains("-m none -O compression=lz4 -R /mnt zpool /dev/sda2"));
    }

    #[test]
    fn datasets_created_parents_first() {
        // every `zfs list` fails, so all parents are missing
        let runner = ScriptedRunner::new().fail("zfs list", 1, "dataset does not exist");
        create_datasets(&runner, &pool()).unwrap();

        let creates: Vec<String> = runner
            .rendered()
            .into_iter()
            .filter(|c| c.starts_with("zfs create"))
            .collect();
        assert_eq!(creates[0], "zfs create -o mountpoint=none zpool/arch");
        let var = creates.iter().position(|c| c.ends_with("zpool/arch/var")).unwrap();
        let log = creates.iter().position(|c| c.ends_with("zpool/arch/var/log")).unwrap();
        assert!(var < log);
        assert!(creates.contains(&"zfs create -o canmount=noauto -o mountpoint=/ zpool/arch/root".to_string()));
    }
}
