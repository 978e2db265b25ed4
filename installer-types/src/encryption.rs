// SPDX-License-Identifier: GPL-3.0-only

//! Disk encryption plan
//!
//! `DiskEncryption` can only be built through its validating constructor,
//! including when deserialized, so an encryption type never carries a
//! selection that does not apply to it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LayoutError, Result};

/// Default LUKS iteration time in milliseconds
pub const DEFAULT_ITER_TIME: u32 = 10_000;

const ITER_TIME_RANGE: std::ops::RangeInclusive<u32> = 100..=120_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    #[default]
    NoEncryption,

    /// LUKS directly on partitions
    Luks,

    /// LVM physical volumes inside LUKS containers
    LvmOnLuks,

    /// LUKS containers on logical volumes
    LuksOnLvm,
}

impl EncryptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoEncryption => "no encryption",
            Self::Luks => "LUKS",
            Self::LvmOnLuks => "LVM on LUKS",
            Self::LuksOnLvm => "LUKS on LVM",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LuksPbkdf {
    #[default]
    Argon2id,
    Pbkdf2,
}

impl LuksPbkdf {
    /// Value passed to `cryptsetup --pbkdf`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Argon2id => "argon2id",
            Self::Pbkdf2 => "pbkdf2",
        }
    }
}

/// A secret that never shows up in `Debug` output or logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Serialized shape, validated on the way in
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskEncryptionRepr {
    encryption_type: EncryptionType,
    #[serde(default)]
    encryption_password: Option<Password>,
    #[serde(default)]
    partitions: Vec<Uuid>,
    #[serde(default)]
    lvm_volumes: Vec<Uuid>,
    #[serde(default)]
    pbkdf: LuksPbkdf,
    #[serde(default = "default_iter_time")]
    iter_time: u32,
    #[serde(default)]
    auto_unlock_root: bool,
}

fn default_iter_time() -> u32 {
    DEFAULT_ITER_TIME
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DiskEncryptionRepr", into = "DiskEncryptionRepr")]
pub struct DiskEncryption {
    encryption_type: EncryptionType,
    encryption_password: Option<Password>,
    partitions: BTreeSet<Uuid>,
    lvm_volumes: BTreeSet<Uuid>,
    pbkdf: LuksPbkdf,
    iter_time: u32,
    auto_unlock_root: bool,
}

impl Default for DiskEncryption {
    fn default() -> Self {
        Self::none()
    }
}

impl DiskEncryption {
    pub fn none() -> Self {
        Self {
            encryption_type: EncryptionType::NoEncryption,
            encryption_password: None,
            partitions: BTreeSet::new(),
            lvm_volumes: BTreeSet::new(),
            pbkdf: LuksPbkdf::Argon2id,
            iter_time: DEFAULT_ITER_TIME,
            auto_unlock_root: false,
        }
    }

    /// Build an encryption plan
    ///
    /// `Luks` and `LvmOnLuks` keep only `partitions`, `LuksOnLvm` keeps only
    /// `lvm_volumes`. An encrypted type needs a password and a non-empty
    /// selection.
    pub fn new(
        encryption_type: EncryptionType,
        password: Option<Password>,
        partitions: impl IntoIterator<Item = Uuid>,
        lvm_volumes: impl IntoIterator<Item = Uuid>,
    ) -> Result<Self> {
        if encryption_type == EncryptionType::NoEncryption {
            return Ok(Self::none());
        }

        let (partitions, lvm_volumes) = match encryption_type {
            EncryptionType::LuksOnLvm => (BTreeSet::new(), lvm_volumes.into_iter().collect()),
            _ => (partitions.into_iter().collect(), BTreeSet::new()),
        };

        if partitions.is_empty() && lvm_volumes.is_empty() {
            return Err(LayoutError::NothingToEncrypt(encryption_type.as_str()));
        }

        match &password {
            Some(pw) if !pw.is_empty() => {}
            _ => return Err(LayoutError::MissingPassword(encryption_type.as_str())),
        }

        Ok(Self {
            encryption_type,
            encryption_password: password,
            partitions,
            lvm_volumes,
            pbkdf: LuksPbkdf::Argon2id,
            iter_time: DEFAULT_ITER_TIME,
            auto_unlock_root: false,
        })
    }

    pub fn with_pbkdf(mut self, pbkdf: LuksPbkdf) -> Self {
        self.pbkdf = pbkdf;
        self
    }

    pub fn with_iter_time(mut self, iter_time: u32) -> Result<Self> {
        if !ITER_TIME_RANGE.contains(&iter_time) {
            return Err(LayoutError::Invalid(format!(
                "iteration time must be between {} and {} ms, got {iter_time}",
                ITER_TIME_RANGE.start(),
                ITER_TIME_RANGE.end()
            )));
        }
        self.iter_time = iter_time;
        Ok(self)
    }

    pub fn with_auto_unlock_root(mut self, auto_unlock_root: bool) -> Self {
        self.auto_unlock_root = auto_unlock_root;
        self
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_type != EncryptionType::NoEncryption
    }

    pub fn password(&self) -> Option<&Password> {
        self.encryption_password.as_ref()
    }

    pub fn partitions(&self) -> &BTreeSet<Uuid> {
        &self.partitions
    }

    pub fn lvm_volumes(&self) -> &BTreeSet<Uuid> {
        &self.lvm_volumes
    }

    pub fn pbkdf(&self) -> LuksPbkdf {
        self.pbkdf
    }

    pub fn iter_time(&self) -> u32 {
        self.iter_time
    }

    pub fn auto_unlock_root(&self) -> bool {
        self.auto_unlock_root
    }

    pub fn contains(&self, obj_id: &Uuid) -> bool {
        self.partitions.contains(obj_id) || self.lvm_volumes.contains(obj_id)
    }

    /// A keyfile is generated for every encrypted element except the root,
    /// which is unlocked by passphrase or through `auto_unlock_root`
    pub fn should_generate_encryption_file(&self, obj_id: &Uuid, is_root: bool) -> bool {
        self.contains(obj_id) && !is_root
    }
}

impl TryFrom<DiskEncryptionRepr> for DiskEncryption {
    type Error = LayoutError;

    fn try_from(repr: DiskEncryptionRepr) -> Result<Self> {
        let enc = DiskEncryption::new(
            repr.encryption_type,
            repr.encryption_password,
            repr.partitions,
            repr.lvm_volumes,
        )?;
        if !enc.is_encrypted() {
            return Ok(enc);
        }
        Ok(enc
            .with_pbkdf(repr.pbkdf)
            .with_iter_time(repr.iter_time)?
            .with_auto_unlock_root(repr.auto_unlock_root))
    }
}

impl From<DiskEncryption> for DiskEncryptionRepr {
    fn from(enc: DiskEncryption) -> Self {
        Self {
            encryption_type: enc.encryption_type,
            encryption_password: enc.encryption_password,
            partitions: enc.partitions.into_iter().collect(),
            lvm_volumes: enc.lvm_volumes.into_iter().collect(),
            pbkdf: enc.pbkdf,
            iter_time: enc.iter_time,
            auto_unlock_root: enc.auto_unlock_root,
        }
    }
}
