// SPDX-License-Identifier: GPL-3.0-only

//! External command execution
//!
//! Every privileged operation goes through a [`CommandRunner`] so the
//! orchestration above it can be exercised against a scripted runner.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{Result, SysError};

/// A command line plus optional stdin and timeout
#[derive(Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// `arch-chroot <target> <program>`
    pub fn chroot(target: &Path, program: impl Into<String>) -> Self {
        Self::new("arch-chroot")
            .arg(target.display().to_string())
            .arg(program)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    /// Bytes written to the child's stdin, never logged
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Printable form, with stdin redacted
    pub fn render(&self) -> String {
        let mut rendered = if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        };
        if self.stdin.is_some() {
            rendered.push_str(" <stdin>");
        }
        rendered
    }
}

impl std::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            ..Self::default()
        }
    }

    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

pub trait CommandRunner {
    /// Run to completion; a non-zero exit status is an error
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput>;

    /// Run and return trimmed stdout
    fn output(&self, cmd: &Cmd) -> Result<String> {
        Ok(self.run(cmd)?.trimmed().to_string())
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        (**self).run(cmd)
    }
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn finish(cmd: &Cmd, stdout: Vec<u8>, stderr: Vec<u8>, code: Option<i32>) -> Result<CommandOutput> {
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        match code {
            Some(0) => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: 0,
            }),
            Some(exit_code) => Err(SysError::CommandFailed {
                command: cmd.render(),
                exit_code,
                stderr: stderr.trim().to_string(),
            }),
            None => Err(SysError::CommandSignalled(cmd.render())),
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        debug!("Running {}", cmd.render());

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SysError::ToolMissing(cmd.program.clone()),
                _ => SysError::Io(e),
            })?;

        if let Some(input) = &cmd.stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input)?;
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match cmd.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(SysError::CommandTimeout {
                            command: cmd.render(),
                            timeout,
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        Self::finish(cmd, stdout, stderr, status.code())
    }
}

/// Logs commands instead of running them
///
/// Every command succeeds with empty output. The recorded sequence is what
/// `--dry-run` prints.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    recorded: std::cell::RefCell<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<String> {
        self.recorded.borrow().clone()
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let rendered = cmd.render();
        tracing::info!("[dry-run] {rendered}");
        self.recorded.borrow_mut().push(rendered);
        Ok(CommandOutput::default())
    }
}

/// Fail early when a required tool is not on `PATH`
pub fn require_tool(tool: &str) -> Result<()> {
    which::which(tool)
        .map(|_| ())
        .map_err(|_| SysError::ToolMissing(tool.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_redacts_stdin() {
        let cmd = Cmd::new("cryptsetup")
            .args(["open", "/dev/sda2", "root"])
            .stdin("secret");
        assert_eq!(cmd.render(), "cryptsetup open /dev/sda2 root <stdin>");
        assert!(!format!("{cmd:?}").contains("secret"));
    }

    #[test]
    fn chroot_prefixes_target() {
        let cmd = Cmd::chroot(Path::new("/mnt"), "mkinitcpio").arg("-P");
        assert_eq!(cmd.render(), "arch-chroot /mnt mkinitcpio -P");
    }

    #[test]
    fn system_runner_reports_exit_codes() {
        let ok = SystemRunner.run(&Cmd::new("sh").args(["-c", "echo hello"])).unwrap();
        assert_eq!(ok.trimmed(), "hello");

        let err = SystemRunner
            .run(&Cmd::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn system_runner_feeds_stdin() {
        let out = SystemRunner
            .run(&Cmd::new("cat").stdin("piped"))
            .unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[test]
    fn system_runner_times_out() {
        let err = SystemRunner
            .run(&Cmd::new("sleep").arg("5").timeout(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, SysError::CommandTimeout { .. }));
    }

    #[test]
    fn dry_run_records_without_running() {
        let runner = DryRunRunner::new();
        let out = runner
            .run(&Cmd::new("wipefs").args(["--all", "/dev/sda"]))
            .unwrap();
        assert!(out.stdout.is_empty());
        assert_eq!(runner.recorded(), vec!["wipefs --all /dev/sda"]);
    }

    #[test]
    fn missing_program_is_reported() {
        let err = SystemRunner
            .run(&Cmd::new("definitely-not-a-real-tool-xyz"))
            .unwrap_err();
        assert!(matches!(err, SysError::ToolMissing(_)));
    }
}
