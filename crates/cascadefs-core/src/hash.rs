//! Content hashing: tagged 20-byte digests used as storage names
//!
//! Every stored object (chunk, catalog, history database) is named by the
//! digest of its sealed bytes. The digest carries its algorithm tag, and the
//! string form appends a one-character storage suffix so that readers can
//! tell blob flavors apart without a lookup.

use crate::error::CoreError;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;
use std::fmt;

/// Number of digest bytes for every supported algorithm (SHAKE-128 truncated)
pub const DIGEST_SIZE: usize = 20;

/// Supported digest algorithms
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-1, the historical default
    Sha1,
    /// RIPEMD-160
    Ripemd160,
    /// SHAKE-128 truncated to 20 bytes
    Shake128,
}

impl HashAlgorithm {
    /// Canonical lowercase name used in configuration and hash strings
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Ripemd160 => "rmd160",
            HashAlgorithm::Shake128 => "shake128",
        }
    }

    /// Parse a configuration value into an algorithm
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            "rmd160" | "ripemd160" | "ripemd-160" => Ok(HashAlgorithm::Ripemd160),
            "shake128" | "shake-128" => Ok(HashAlgorithm::Shake128),
            other => Err(CoreError::UnknownHashAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Storage flavor of a named object, encoded as a suffix character
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageSuffix {
    /// Plain data blob (no suffix character)
    #[default]
    Data,
    /// Sealed catalog
    Catalog,
    /// History database
    History,
    /// Partial file chunk
    Partial,
}

impl StorageSuffix {
    /// Suffix string appended to the hex digest
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageSuffix::Data => "",
            StorageSuffix::Catalog => "C",
            StorageSuffix::History => "H",
            StorageSuffix::Partial => "P",
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'C' => Some(StorageSuffix::Catalog),
            'H' => Some(StorageSuffix::History),
            'P' => Some(StorageSuffix::Partial),
            _ => None,
        }
    }
}

/// A tagged content hash. The algorithm is fixed at construction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    bytes: [u8; DIGEST_SIZE],
}

impl ContentHash {
    /// Wrap raw digest bytes under the given algorithm tag
    pub fn from_bytes(algorithm: HashAlgorithm, bytes: [u8; DIGEST_SIZE]) -> Self {
        Self { algorithm, bytes }
    }

    /// Digest a byte slice
    pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut bytes = [0u8; DIGEST_SIZE];
        match algorithm {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                Digest::update(&mut hasher, data);
                bytes.copy_from_slice(&hasher.finalize());
            }
            HashAlgorithm::Ripemd160 => {
                let mut hasher = Ripemd160::new();
                Digest::update(&mut hasher, data);
                bytes.copy_from_slice(&hasher.finalize());
            }
            HashAlgorithm::Shake128 => {
                let mut hasher = Shake128::default();
                hasher.update(data);
                hasher.finalize_xof().read(&mut bytes);
            }
        }
        Self { algorithm, bytes }
    }

    /// The algorithm this digest was computed with
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.bytes
    }

    /// Lowercase hex of the digest, without algorithm prefix or suffix
    pub fn to_hex(&self) -> String {
        const HEX: &[u8] = b"0123456789abcdef";
        let mut out = String::with_capacity(DIGEST_SIZE * 2);
        for &b in &self.bytes {
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xf) as usize] as char);
        }
        out
    }

    /// Full string form: `<alg>-<hex><suffix>`
    pub fn to_string_suffixed(&self, suffix: StorageSuffix) -> String {
        format!("{}-{}{}", self.algorithm.name(), self.to_hex(), suffix.as_str())
    }

    /// Parse the string form produced by [`ContentHash::to_string_suffixed`]
    pub fn parse(s: &str) -> Result<(Self, StorageSuffix), CoreError> {
        let malformed = || CoreError::MalformedHash(s.to_string());
        let (alg, rest) = s.split_once('-').ok_or_else(malformed)?;
        let algorithm = HashAlgorithm::parse(alg).map_err(|_| malformed())?;

        let raw = rest.as_bytes();
        let (hex, suffix) = if raw.len() == DIGEST_SIZE * 2 {
            (raw, StorageSuffix::Data)
        } else if raw.len() == DIGEST_SIZE * 2 + 1 {
            (
                &raw[..DIGEST_SIZE * 2],
                StorageSuffix::from_char(raw[DIGEST_SIZE * 2] as char).ok_or_else(malformed)?,
            )
        } else {
            return Err(malformed());
        };

        let mut bytes = [0u8; DIGEST_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let high = hex_nibble(hex[i * 2]).ok_or_else(malformed)?;
            let low = hex_nibble(hex[i * 2 + 1]).ok_or_else(malformed)?;
            *byte = (high << 4) | low;
        }
        Ok((Self { algorithm, bytes }, suffix))
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.name(), self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}
