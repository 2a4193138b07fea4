//! Byte quantities with human-readable parsing and formatting
//!
//! Sizes appear in configuration (`gc_size_diff = "256MB"`) and in disk
//! usage reports. Units are binary (1 KB = 1024 bytes).

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

/// A number of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(pub u64);

const UNITS: [(&str, u64); 5] = [
    ("TB", ByteSize::TB.0),
    ("GB", ByteSize::GB.0),
    ("MB", ByteSize::MB.0),
    ("KB", ByteSize::KB.0),
    ("B", 1),
];

impl ByteSize {
    /// One byte
    pub const B: ByteSize = ByteSize(1);
    /// 1024 bytes
    pub const KB: ByteSize = ByteSize(1 << 10);
    /// 1024 KB
    pub const MB: ByteSize = ByteSize(1 << 20);
    /// 1024 MB
    pub const GB: ByteSize = ByteSize(1 << 30);
    /// 1024 GB
    pub const TB: ByteSize = ByteSize(1 << 40);

    /// Size in bytes
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// True for zero bytes
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtraction clamped at zero
    pub fn saturating_sub(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_sub(rhs.0))
    }
}

impl From<u64> for ByteSize {
    fn from(n: u64) -> Self {
        ByteSize(n)
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ByteSize {
    fn add_assign(&mut self, rhs: ByteSize) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for ByteSize {
    type Output = ByteSize;

    fn sub(self, rhs: ByteSize) -> ByteSize {
        self.saturating_sub(rhs)
    }
}

impl std::iter::Sum for ByteSize {
    fn sum<I: Iterator<Item = ByteSize>>(iter: I) -> ByteSize {
        iter.fold(ByteSize(0), |acc, s| acc + s)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Largest unit that divides the value exactly, so output parses back losslessly.
        for (suffix, unit) in UNITS {
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "0B")
    }
}

/// Error returned when a byte size string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid byte size: {0:?}")]
pub struct ParseByteSizeError(String);

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);
        let number: f64 = number
            .parse()
            .map_err(|_| ParseByteSizeError(s.to_string()))?;
        if number < 0.0 || !number.is_finite() {
            return Err(ParseByteSizeError(s.to_string()));
        }

        let suffix = suffix.trim().to_ascii_uppercase();
        let unit = match suffix.as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => ByteSize::KB.0,
            "M" | "MB" | "MIB" => ByteSize::MB.0,
            "G" | "GB" | "GIB" => ByteSize::GB.0,
            "T" | "TB" | "TIB" => ByteSize::TB.0,
            _ => return Err(ParseByteSizeError(s.to_string())),
        };
        Ok(ByteSize((number * unit as f64).round() as u64))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct ByteSizeVisitor;

impl<'de> Visitor<'de> for ByteSizeVisitor {
    type Value = ByteSize;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte count or a size string such as \"256MB\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
        Ok(ByteSize(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
        u64::try_from(v)
            .map(ByteSize)
            .map_err(|_| E::custom("byte size must not be negative"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ByteSizeVisitor)
    }
}
