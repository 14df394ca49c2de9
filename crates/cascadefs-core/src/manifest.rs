//! The signed root manifest of a repository revision
//!
//! One line per field, single-letter keys. The driver signs and publishes
//! the text; this crate only builds and parses it.

use crate::error::CoreError;
use crate::hash::{ContentHash, StorageSuffix};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Root manifest referencing a snapshotted catalog tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Content hash of the sealed root catalog
    pub root_hash: ContentHash,
    /// Size of the sealed root catalog in bytes
    pub root_size: u64,
    /// Fully qualified repository name
    pub repo_name: String,
    /// Client time-to-live in seconds
    pub ttl: u64,
    /// Repository revision number
    pub revision: u64,
    /// Publish timestamp, seconds since the Unix epoch
    pub published_at: u64,
}

impl Manifest {
    /// Build a manifest stamped with the current time
    pub fn new(
        root_hash: ContentHash,
        root_size: u64,
        repo_name: String,
        ttl: u64,
        revision: u64,
    ) -> Self {
        let published_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            root_hash,
            root_size,
            repo_name,
            ttl,
            revision,
            published_at,
        }
    }

    /// Serialize to the line-oriented text form
    pub fn to_text(&self) -> String {
        format!(
            "C{}\nB{}\nR{}\nT{}\nD{}\nS{}\n",
            self.root_hash.to_string_suffixed(StorageSuffix::Catalog),
            self.root_size,
            self.repo_name,
            self.published_at,
            self.ttl,
            self.revision,
        )
    }

    /// Parse the text form produced by [`Manifest::to_text`]
    pub fn from_text(text: &str) -> Result<Self, CoreError> {
        let mut root_hash = None;
        let mut root_size = None;
        let mut repo_name = None;
        let mut published_at = None;
        let mut ttl = None;
        let mut revision = None;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let malformed = || CoreError::MalformedManifest(line.to_string());
            if !line.is_char_boundary(1) {
                return Err(malformed());
            }
            let (key, value) = line.split_at(1);
            match key {
                "C" => {
                    let (hash, _) = ContentHash::parse(value)?;
                    root_hash = Some(hash);
                }
                "B" => root_size = Some(value.parse().map_err(|_| malformed())?),
                "R" => repo_name = Some(value.to_string()),
                "T" => published_at = Some(value.parse().map_err(|_| malformed())?),
                "D" => ttl = Some(value.parse().map_err(|_| malformed())?),
                "S" => revision = Some(value.parse().map_err(|_| malformed())?),
                _ => return Err(malformed()),
            }
        }

        let missing = |field: &str| CoreError::MalformedManifest(field.to_string());
        Ok(Self {
            root_hash: root_hash.ok_or_else(|| missing("C"))?,
            root_size: root_size.ok_or_else(|| missing("B"))?,
            repo_name: repo_name.ok_or_else(|| missing("R"))?,
            ttl: ttl.ok_or_else(|| missing("D"))?,
            revision: revision.ok_or_else(|| missing("S"))?,
            published_at: published_at.ok_or_else(|| missing("T"))?,
        })
    }
}
