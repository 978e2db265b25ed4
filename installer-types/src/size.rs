// SPDX-License-Identifier: GPL-3.0-only

//! Sector-size-aware storage quantities
//!
//! All arithmetic is done on integer bytes. Conversions into sectors round up
//! so a partition never ends short of its requested length; every other
//! conversion truncates.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};

/// GPT alignment boundary (1 MiB)
pub const GPT_ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// Storage unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    B,
    #[serde(rename = "kB")]
    KB,
    MB,
    GB,
    TB,
    KiB,
    MiB,
    GiB,
    TiB,
    #[serde(rename = "sectors")]
    Sectors,
}

impl Unit {
    /// Byte multiplier, or `None` for sectors which depend on the device
    pub fn multiplier(self) -> Option<u64> {
        match self {
            Self::B => Some(1),
            Self::KB => Some(1_000),
            Self::MB => Some(1_000_000),
            Self::GB => Some(1_000_000_000),
            Self::TB => Some(1_000_000_000_000),
            Self::KiB => Some(1 << 10),
            Self::MiB => Some(1 << 20),
            Self::GiB => Some(1 << 30),
            Self::TiB => Some(1 << 40),
            Self::Sectors => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::B => "B",
            Self::KB => "kB",
            Self::MB => "MB",
            Self::GB => "GB",
            Self::TB => "TB",
            Self::KiB => "KiB",
            Self::MiB => "MiB",
            Self::GiB => "GiB",
            Self::TiB => "TiB",
            Self::Sectors => "sectors",
        }
    }

    /// Binary units from largest to smallest
    pub fn binary_units() -> [Unit; 5] {
        [Self::TiB, Self::GiB, Self::MiB, Self::KiB, Self::B]
    }
}

impl FromStr for Unit {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "B" => Ok(Self::B),
            "kB" | "KB" => Ok(Self::KB),
            "MB" => Ok(Self::MB),
            "GB" => Ok(Self::GB),
            "TB" => Ok(Self::TB),
            "KiB" => Ok(Self::KiB),
            "MiB" => Ok(Self::MiB),
            "GiB" => Ok(Self::GiB),
            "TiB" => Ok(Self::TiB),
            "sectors" | "s" => Ok(Self::Sectors),
            other => Err(LayoutError::UnknownUnit(other.to_string())),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical sector size of a device in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct SectorSize(u64);

impl SectorSize {
    pub fn new(bytes: u64) -> Result<Self> {
        if bytes == 0 || bytes % 512 != 0 {
            return Err(LayoutError::InvalidSectorSize(bytes));
        }
        Ok(Self(bytes))
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for SectorSize {
    fn default() -> Self {
        Self(512)
    }
}

impl TryFrom<u64> for SectorSize {
    type Error = LayoutError;

    fn try_from(value: u64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SectorSize> for u64 {
    fn from(value: SectorSize) -> Self {
        value.0
    }
}

/// A storage quantity bound to the sector size of the device it lives on
///
/// Equality and ordering compare normalized bytes, so `1 GiB == 1024 MiB`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Size {
    /// Magnitude in `unit`
    pub value: u64,

    /// Unit of `value`
    pub unit: Unit,

    /// Sector size used when converting to or from sectors
    #[serde(default)]
    pub sector_size: SectorSize,
}

impl Size {
    pub fn new(value: u64, unit: Unit, sector_size: SectorSize) -> Self {
        Self {
            value,
            unit,
            sector_size,
        }
    }

    pub fn from_bytes(bytes: u64, sector_size: SectorSize) -> Self {
        Self::new(bytes, Unit::B, sector_size)
    }

    pub fn mib(value: u64, sector_size: SectorSize) -> Self {
        Self::new(value, Unit::MiB, sector_size)
    }

    pub fn gib(value: u64, sector_size: SectorSize) -> Self {
        Self::new(value, Unit::GiB, sector_size)
    }

    /// Normalized size in bytes
    pub fn bytes(&self) -> u64 {
        match self.unit.multiplier() {
            Some(mult) => self.value.saturating_mul(mult),
            None => self.value.saturating_mul(self.sector_size.bytes()),
        }
    }

    /// Convert into `target`
    ///
    /// Conversion into sectors uses `sector_size` when given, otherwise the
    /// sector size this value already carries. Sector conversion rounds up,
    /// everything else truncates.
    pub fn convert(&self, target: Unit, sector_size: Option<SectorSize>) -> Size {
        let sector_size = sector_size.unwrap_or(self.sector_size);
        if target == self.unit && sector_size == self.sector_size {
            return *self;
        }

        let bytes = self.bytes();
        let value = match target.multiplier() {
            Some(mult) => bytes / mult,
            None => bytes.div_ceil(sector_size.bytes()),
        };

        Size::new(value, target, sector_size)
    }

    /// Size in sectors of the carried sector size, rounded up
    pub fn sectors(&self) -> u64 {
        self.convert(Unit::Sectors, None).value
    }

    /// Round down to the 1 MiB alignment boundary
    pub fn align(&self) -> Size {
        let bytes = self.bytes();
        Size::from_bytes(bytes - bytes % GPT_ALIGNMENT_BYTES, self.sector_size)
    }

    /// Round up to the 1 MiB alignment boundary
    pub fn align_up(&self) -> Size {
        Size::from_bytes(
            self.bytes().div_ceil(GPT_ALIGNMENT_BYTES) * GPT_ALIGNMENT_BYTES,
            self.sector_size,
        )
    }

    pub fn is_aligned(&self) -> bool {
        self.bytes() % GPT_ALIGNMENT_BYTES == 0
    }

    /// Reserve 1 MiB at the end of the device for the backup GPT header
    pub fn gpt_end(&self) -> Size {
        *self - Size::mib(1, self.sector_size)
    }

    /// Format in the largest binary unit that yields a value of at least one
    pub fn format_highest(&self) -> String {
        let bytes = self.bytes();
        for unit in Unit::binary_units() {
            let mult = unit.multiplier().unwrap_or(1);
            if bytes >= mult || unit == Unit::B {
                let whole = bytes / mult;
                let tenths = (bytes % mult) * 10 / mult;
                return if tenths == 0 {
                    format!("{whole} {unit}")
                } else {
                    format!("{whole}.{tenths} {unit}")
                };
            }
        }
        format!("{bytes} B")
    }

    /// Parse `"<value> <unit>"` or `"<value><unit>"` e.g. `"512 MiB"`
    pub fn parse(text: &str, sector_size: SectorSize) -> Result<Size> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);
        let value: u64 = number
            .parse()
            .map_err(|_| LayoutError::Invalid(format!("invalid size: {text}")))?;
        let unit = match unit.trim() {
            "" => Unit::B,
            other => other.parse()?,
        };
        Ok(Size::new(value, unit, sector_size))
    }
}

impl PartialEq for Size {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Size {}

impl PartialOrd for Size {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Size {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl Add for Size {
    type Output = Size;

    fn add(self, rhs: Size) -> Size {
        Size::from_bytes(self.bytes().saturating_add(rhs.bytes()), self.sector_size)
    }
}

impl Sub for Size {
    type Output = Size;

    /// Saturates at zero
    fn sub(self, rhs: Size) -> Size {
        Size::from_bytes(self.bytes().saturating_sub(rhs.bytes()), self.sector_size)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_highest())
    }
}
