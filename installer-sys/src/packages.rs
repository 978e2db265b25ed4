// SPDX-License-Identifier: GPL-3.0-only

//! Installing packages into the target root

use std::path::{Path, PathBuf};

use tracing::info;

use crate::Result;
use crate::clock::{Clock, PACMAN_LOCK, wait_for_pacman_lock};
use crate::command::{Cmd, CommandRunner};

pub trait PackageInstaller {
    /// Install `packages` into the root mounted at `target`
    fn strap(&self, target: &Path, packages: &[String]) -> Result<()>;
}

/// `pacstrap` from the live environment
pub struct Pacstrap<'a> {
    runner: &'a dyn CommandRunner,
    clock: &'a dyn Clock,
    lock_path: PathBuf,
}

impl<'a> Pacstrap<'a> {
    pub fn new(runner: &'a dyn CommandRunner, clock: &'a dyn Clock) -> Self {
        Self {
            runner,
            clock,
            lock_path: PathBuf::from(PACMAN_LOCK),
        }
    }

    pub fn with_lock_path(mut self, lock_path: impl Into<PathBuf>) -> Self {
        self.lock_path = lock_path.into();
        self
    }
}

impl PackageInstaller for Pacstrap<'_> {
    fn strap(&self, target: &Path, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        wait_for_pacman_lock(self.clock, &self.lock_path)?;

        info!("Installing packages: {}", packages.join(" "));
        let cmd = Cmd::new("pacstrap")
            .args(["-C", "/etc/pacman.conf", "-K"])
            .path_arg(target)
            .args(packages.iter().cloned())
            .args(["--noconfirm", "--needed"]);
        self.runner.run(&cmd)?;
        Ok(())
    }
}
