// SPDX-License-Identifier: GPL-3.0-only

//! LUKS2 containers through `cryptsetup`

use std::fs;
use std::io::Write;
use std::ops::Deref;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use installer_types::{LuksPbkdf, Password};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::command::{Cmd, CommandRunner};
use crate::{Result, SysError};

/// Size of generated keyfiles in bytes
pub const KEYFILE_SIZE: usize = 2048;

/// Directory the initramfs searches for `<mapper>.key` files
pub const KEYFILE_DIR: &str = "etc/cryptsetup-keys.d";

/// Cost parameters for a new key slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySlotCost {
    /// `--pbkdf-memory` in KiB
    pub pbkdf_memory: Option<u32>,

    /// `--iter-time` in milliseconds
    pub iter_time: Option<u32>,
}

impl KeySlotCost {
    /// Cheap enough for GRUB's Argon2id implementation to open
    pub fn for_grub(pbkdf: LuksPbkdf) -> Self {
        Self {
            pbkdf_memory: matches!(pbkdf, LuksPbkdf::Argon2id).then_some(32 * 1024),
            iter_time: Some(200),
        }
    }
}

/// A LUKS2 container bound to a backing device and a mapper name
pub struct Luks2<'r> {
    runner: &'r dyn CommandRunner,
    luks_dev_path: PathBuf,
    mapper_name: String,
    password: Option<Password>,
    unlocked: bool,
}

impl std::fmt::Debug for Luks2<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Luks2")
            .field("luks_dev_path", &self.luks_dev_path)
            .field("mapper_name", &self.mapper_name)
            .field("unlocked", &self.unlocked)
            .finish_non_exhaustive()
    }
}

impl<'r> Luks2<'r> {
    pub fn new(
        runner: &'r dyn CommandRunner,
        luks_dev_path: impl Into<PathBuf>,
        mapper_name: impl Into<String>,
        password: Option<Password>,
    ) -> Self {
        Self {
            runner,
            luks_dev_path: luks_dev_path.into(),
            mapper_name: mapper_name.into(),
            password,
            unlocked: false,
        }
    }

    pub fn luks_dev_path(&self) -> &Path {
        &self.luks_dev_path
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// `/dev/mapper/<name>` while unlocked
    pub fn mapper_dev(&self) -> Option<PathBuf> {
        self.unlocked
            .then(|| PathBuf::from("/dev/mapper").join(&self.mapper_name))
    }

    fn secret(&self) -> Result<&[u8]> {
        self.password
            .as_ref()
            .map(|p| p.expose().as_bytes())
            .ok_or_else(|| {
                SysError::Layout(installer_types::LayoutError::MissingPassword("LUKS"))
            })
    }

    /// Write a fresh LUKS2 header, destroying whatever was on the device
    pub fn format(&self, pbkdf: LuksPbkdf, iter_time: u32) -> Result<()> {
        info!("Formatting {} as LUKS2", self.luks_dev_path.display());
        let cmd = Cmd::new("cryptsetup")
            .args(["--batch-mode", "--verbose", "--type", "luks2"])
            .args(["--pbkdf", pbkdf.as_str()])
            .args(["--hash", "sha512", "--key-size", "512"])
            .args(["--iter-time".to_string(), iter_time.to_string()])
            .args(["--key-file", "-", "--use-urandom", "luksFormat"])
            .path_arg(&self.luks_dev_path)
            .stdin(self.secret()?);
        self.runner.run(&cmd)?;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        if self.unlocked {
            return Ok(());
        }
        debug!(
            "Unlocking {} as {}",
            self.luks_dev_path.display(),
            self.mapper_name
        );
        let cmd = Cmd::new("cryptsetup")
            .args(["open", "--type", "luks2", "--key-file", "-"])
            .path_arg(&self.luks_dev_path)
            .arg(&self.mapper_name)
            .stdin(self.secret()?);
        self.runner.run(&cmd)?;
        self.unlocked = true;
        Ok(())
    }

    pub fn lock(&mut self) -> Result<()> {
        if !self.unlocked {
            return Ok(());
        }
        debug!("Locking {}", self.mapper_name);
        self.runner
            .run(&Cmd::new("cryptsetup").arg("close").arg(&self.mapper_name))?;
        self.unlocked = false;
        Ok(())
    }

    /// Unlock for the lifetime of the returned guard
    pub fn unlock_scoped(&mut self) -> Result<UnlockedLuks<'_, 'r>> {
        self.unlock()?;
        Ok(UnlockedLuks { handle: self })
    }

    /// UUID stored in the LUKS header
    pub fn uuid(&self) -> Result<String> {
        self.runner.output(
            &Cmd::new("cryptsetup")
                .arg("luksUUID")
                .path_arg(&self.luks_dev_path),
        )
    }

    /// Number of occupied key slots
    pub fn key_slot_count(&self) -> Result<usize> {
        let dump = self.runner.output(
            &Cmd::new("cryptsetup")
                .arg("luksDump")
                .path_arg(&self.luks_dev_path),
        )?;
        Ok(parse_keyslots(&dump).len())
    }

    /// Register `keyfile` as an additional key, authorised by the passphrase
    pub fn add_key(&self, keyfile: &Path, cost: KeySlotCost) -> Result<()> {
        debug!(
            "Adding key {} to {}",
            keyfile.display(),
            self.luks_dev_path.display()
        );
        let mut cmd = Cmd::new("cryptsetup").args(["luksAddKey", "--key-file", "-"]);
        if let Some(memory) = cost.pbkdf_memory {
            cmd = cmd.args(["--pbkdf-memory".to_string(), memory.to_string()]);
        }
        if let Some(iter_time) = cost.iter_time {
            cmd = cmd.args(["--iter-time".to_string(), iter_time.to_string()]);
        }
        let cmd = cmd
            .path_arg(&self.luks_dev_path)
            .path_arg(keyfile)
            .stdin(self.secret()?);
        self.runner.run(&cmd)?;
        Ok(())
    }

    /// Generate `<target>/etc/cryptsetup-keys.d/<name>.key` and add it as a key
    ///
    /// Returns the keyfile path as seen from inside the target.
    pub fn create_keyfile(&self, target: &Path, name: &str, cost: KeySlotCost) -> Result<PathBuf> {
        let dir = target.join(KEYFILE_DIR);
        fs::create_dir_all(&dir)?;

        let host_path = dir.join(format!("{name}.key"));
        let mut key = vec![0u8; KEYFILE_SIZE];
        rand::rng().fill_bytes(&mut key);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&host_path)?;
        file.write_all(&key)?;
        file.sync_all()?;
        drop(file);
        fs::set_permissions(&host_path, fs::Permissions::from_mode(0o000))?;

        self.add_key(&host_path, cost)?;
        info!("Created keyfile for {}", self.mapper_name);

        Ok(Path::new("/").join(KEYFILE_DIR).join(format!("{name}.key")))
    }
}

/// Locks the container when dropped
pub struct UnlockedLuks<'a, 'r> {
    handle: &'a mut Luks2<'r>,
}

impl<'r> Deref for UnlockedLuks<'_, 'r> {
    type Target = Luks2<'r>;

    fn deref(&self) -> &Self::Target {
        self.handle
    }
}

impl Drop for UnlockedLuks<'_, '_> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.lock() {
            warn!("Failed to lock {}: {e}", self.handle.mapper_name);
        }
    }
}

/// Slot numbers listed under `Keyslots:` in `cryptsetup luksDump`
pub fn parse_keyslots(dump: &str) -> Vec<u32> {
    let mut in_section = false;
    let mut slots = Vec::new();
    for line in dump.lines() {
        if !line.starts_with(char::is_whitespace) {
            in_section = line.trim_end() == "Keyslots:";
            continue;
        }
        if !in_section {
            continue;
        }
        let trimmed = line.trim();
        if let Some((slot, kind)) = trimmed.split_once(':')
            && kind.trim().starts_with("luks2")
            && let Ok(slot) = slot.trim().parse()
        {
            slots.push(slot);
        }
    }
    slots
}
