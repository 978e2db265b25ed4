// SPDX-License-Identifier: GPL-3.0-only

//! mkinitcpio configuration owned by the installation session

use std::fs;
use std::path::Path;

use installer_sys::{Cmd, CommandRunner};
use tracing::{info, warn};

const MKINITCPIO_CONF: &str = "etc/mkinitcpio.conf";

const DEFAULT_HOOKS: [&str; 11] = [
    "base",
    "systemd",
    "autodetect",
    "microcode",
    "modconf",
    "kms",
    "keyboard",
    "sd-vconsole",
    "block",
    "filesystems",
    "fsck",
];

/// The `MODULES`, `BINARIES`, `FILES` and `HOOKS` arrays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initramfs {
    pub modules: Vec<String>,
    pub binaries: Vec<String>,
    pub files: Vec<String>,
    pub hooks: Vec<String>,
}

impl Default for Initramfs {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            binaries: Vec::new(),
            files: Vec::new(),
            hooks: DEFAULT_HOOKS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl Initramfs {
    /// Insert `hook` before `anchor`, or append when `anchor` is absent
    pub fn insert_hook_before(&mut self, hook: &str, anchor: &str) {
        if self.hooks.iter().any(|h| h == hook) {
            return;
        }
        match self.hooks.iter().position(|h| h == anchor) {
            Some(index) => self.hooks.insert(index, hook.to_string()),
            None => self.hooks.push(hook.to_string()),
        }
    }

    pub fn remove_hook(&mut self, hook: &str) {
        self.hooks.retain(|h| h != hook);
    }

    pub fn has_hook(&self, hook: &str) -> bool {
        self.hooks.iter().any(|h| h == hook)
    }

    pub fn add_module(&mut self, module: &str) {
        if !self.modules.iter().any(|m| m == module) {
            self.modules.push(module.to_string());
        }
    }

    pub fn add_file(&mut self, file: impl Into<String>) {
        let file = file.into();
        if !self.files.contains(&file) {
            self.files.push(file);
        }
    }

    /// Replace the four array assignments in an existing `mkinitcpio.conf`
    ///
    /// Only unindented `NAME=` lines are replaced; comments and anything
    /// else are kept as they are.
    pub fn rewrite_conf(&self, content: &str) -> String {
        let mut out: Vec<String> = content
            .lines()
            .map(|line| {
                let replacement = [
                    ("MODULES=", &self.modules),
                    ("BINARIES=", &self.binaries),
                    ("FILES=", &self.files),
                    ("HOOKS=", &self.hooks),
                ]
                .into_iter()
                .find(|(key, _)| line.starts_with(key));

                match replacement {
                    Some((key, values)) => format!("{key}({})", values.join(" ")),
                    None => line.to_string(),
                }
            })
            .collect();
        if content.ends_with('\n') {
            out.push(String::new());
        }
        out.join("\n")
    }

    /// Write the arrays into the target and run `mkinitcpio -P`
    ///
    /// Returns false when the target has no mkinitcpio configuration or the
    /// generator fails; either leaves a system that may not boot, which the
    /// caller reports rather than aborting.
    pub fn regenerate(&self, runner: &dyn CommandRunner, target: &Path) -> bool {
        let conf = target.join(MKINITCPIO_CONF);
        let content = match fs::read_to_string(&conf) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read {}: {e}", conf.display());
                return false;
            }
        };
        if let Err(e) = fs::write(&conf, self.rewrite_conf(&content)) {
            warn!("Cannot write {}: {e}", conf.display());
            return false;
        }

        info!("Generating initramfs with hooks: {}", self.hooks.join(" "));
        match runner.run(&Cmd::chroot(target, "mkinitcpio").arg("-P")) {
            Ok(_) => true,
            Err(e) => {
                warn!("mkinitcpio failed: {e}");
                false
            }
        }
    }
}
