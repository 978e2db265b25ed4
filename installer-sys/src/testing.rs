// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles for the system seams
//!
//! Enabled with the `testing` feature so dependent crates can drive their
//! orchestration without touching real devices.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use installer_types::BlockDevice;

use crate::clock::Clock;
use crate::command::{Cmd, CommandOutput, CommandRunner};
use crate::devices::{DeviceQuery, LsblkInfo};
use crate::packages::PackageInstaller;
use crate::{Result, SysError};

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Fail { exit_code: i32, stderr: String },
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    reply: Reply,
    once: bool,
}

/// Records every command and answers from prefix-matched rules
///
/// Unmatched commands succeed with empty output. Rules are checked in the
/// order they were added; `once` rules are removed after their first match.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<Cmd>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, prefix: &str, reply: Reply, once: bool) -> Self {
        self.rules.borrow_mut().push(Rule {
            prefix: prefix.to_string(),
            reply,
            once,
        });
        self
    }

    pub fn respond(self, prefix: &str, output: CommandOutput) -> Self {
        self.push(prefix, Reply::Output(output), false)
    }

    pub fn respond_once(self, prefix: &str, output: CommandOutput) -> Self {
        self.push(prefix, Reply::Output(output), true)
    }

    pub fn fail(self, prefix: &str, exit_code: i32, stderr: &str) -> Self {
        self.push(
            prefix,
            Reply::Fail {
                exit_code,
                stderr: stderr.to_string(),
            },
            false,
        )
    }

    pub fn fail_once(self, prefix: &str, exit_code: i32, stderr: &str) -> Self {
        self.push(
            prefix,
            Reply::Fail {
                exit_code,
                stderr: stderr.to_string(),
            },
            true,
        )
    }

    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.borrow().clone()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.calls.borrow().iter().map(Cmd::render).collect()
    }

    /// Index of the first command starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.rendered().iter().position(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.rendered()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(cmd.clone());
        let rendered = cmd.render();

        let mut rules = self.rules.borrow_mut();
        let Some(index) = rules.iter().position(|r| rendered.starts_with(&r.prefix)) else {
            return Ok(CommandOutput::default());
        };
        let reply = if rules[index].once {
            rules.remove(index).reply
        } else {
            rules[index].reply.clone()
        };

        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Fail { exit_code, stderr } => Err(SysError::CommandFailed {
                command: rendered,
                exit_code,
                stderr,
            }),
        }
    }
}

/// A clock that only advances when slept on
#[derive(Debug)]
pub struct FakeClock {
    start: Instant,
    offset: Cell<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.offset.set(self.offset.get() + duration);
    }
}

/// Fixed device tree
#[derive(Debug, Default, Clone)]
pub struct StaticDevices {
    pub devices: Vec<LsblkInfo>,
}

impl StaticDevices {
    pub fn new(devices: Vec<LsblkInfo>) -> Self {
        Self { devices }
    }

    fn all(&self) -> impl Iterator<Item = &LsblkInfo> {
        fn walk<'a>(info: &'a LsblkInfo, out: &mut Vec<&'a LsblkInfo>) {
            out.push(info);
            for child in &info.children {
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        for dev in &self.devices {
            walk(dev, &mut out);
        }
        out.into_iter()
    }
}

impl DeviceQuery for StaticDevices {
    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| d.kind == "disk")
            .map(LsblkInfo::to_block_device)
            .collect())
    }

    fn info(&self, path: &Path) -> Result<LsblkInfo> {
        self.all()
            .find(|i| i.path == path)
            .cloned()
            .ok_or_else(|| SysError::DeviceNotFound(path.display().to_string()))
    }

    fn find_by_mountpoint(&self, mountpoint: &Path) -> Result<Option<LsblkInfo>> {
        Ok(self
            .all()
            .find(|i| i.mountpoints.iter().any(|m| m == mountpoint))
            .cloned())
    }
}

/// Records package requests instead of installing anything
#[derive(Debug, Default)]
pub struct RecordingInstaller {
    pub requests: RefCell<Vec<(PathBuf, Vec<String>)>>,
}

impl RecordingInstaller {
    pub fn installed(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .flat_map(|(_, pkgs)| pkgs.iter().cloned())
            .collect()
    }
}

impl PackageInstaller for RecordingInstaller {
    fn strap(&self, target: &Path, packages: &[String]) -> Result<()> {
        self.requests
            .borrow_mut()
            .push((target.to_path_buf(), packages.to_vec()));
        Ok(())
    }
}

/// Shorthand for an lsblk row in tests
pub fn lsblk_node(path: &str, kind: &str) -> LsblkInfo {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    LsblkInfo {
        name,
        path: PathBuf::from(path),
        kind: kind.to_string(),
        ..LsblkInfo::default()
    }
}
