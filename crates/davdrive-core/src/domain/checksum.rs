//! Tagged content checksums
//!
//! Checksums travel on the wire as `ALGO:HEX` strings (the `OC-Checksum`
//! header). A header may carry several entries separated by whitespace,
//! possibly including algorithms we do not support; parsing picks the
//! strongest supported entry and ignores the rest.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Checksum algorithms negotiable with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Adler32,
    Md5,
    Sha1,
    Sha256,
    Sha3_256,
}

impl ChecksumAlgorithm {
    /// Wire name as used in headers and capability lists
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Adler32 => "ADLER32",
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha1 => "SHA1",
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Sha3_256 => "SHA3-256",
        }
    }

    /// Relative strength used to pick among multiple advertised checksums.
    /// Higher is stronger.
    #[must_use]
    pub fn strength(&self) -> u8 {
        match self {
            ChecksumAlgorithm::Adler32 => 0,
            ChecksumAlgorithm::Md5 => 1,
            ChecksumAlgorithm::Sha1 => 2,
            ChecksumAlgorithm::Sha256 => 3,
            ChecksumAlgorithm::Sha3_256 => 4,
        }
    }

    /// Weak checksums prove nothing when the modification time moved;
    /// only a collision-resistant digest may suppress a download then.
    #[must_use]
    pub fn is_weak(&self) -> bool {
        matches!(self, ChecksumAlgorithm::Adler32)
    }

    /// Parses a wire name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ADLER32" => Some(ChecksumAlgorithm::Adler32),
            "MD5" => Some(ChecksumAlgorithm::Md5),
            "SHA1" => Some(ChecksumAlgorithm::Sha1),
            "SHA256" => Some(ChecksumAlgorithm::Sha256),
            "SHA3-256" => Some(ChecksumAlgorithm::Sha3_256),
            _ => None,
        }
    }
}

impl Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A tagged checksum value of the form `ALGO:HEX`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algo: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algo: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algo,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Parses a single `ALGO:HEX` entry.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidChecksum(s.to_string()))?;
        let algo = ChecksumAlgorithm::parse(algo)
            .ok_or_else(|| DomainError::InvalidChecksum(format!("unknown algorithm in {s:?}")))?;
        if hex.is_empty() {
            return Err(DomainError::InvalidChecksum(s.to_string()));
        }
        Ok(Self::new(algo, hex))
    }

    /// Parses a checksum header that may carry several whitespace-separated
    /// entries, returning the strongest entry with a supported algorithm.
    ///
    /// Unknown algorithms and malformed entries are skipped; `None` is
    /// returned only when no supported entry is present at all.
    #[must_use]
    pub fn strongest_in_header(header: &str) -> Option<Self> {
        header
            .split_whitespace()
            .filter_map(|entry| Self::parse(entry).ok())
            .max_by_key(|c| c.algo.strength())
    }

    /// Case-insensitive value comparison; both sides must use the same
    /// algorithm for the comparison to be meaningful.
    #[must_use]
    pub fn matches(&self, other: &Checksum) -> bool {
        self.algo == other.algo && self.hex.eq_ignore_ascii_case(&other.hex)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
