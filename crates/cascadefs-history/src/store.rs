//! The tag database
//!
//! A small bincode file keyed by the repository name, holding the tag
//! vector in insertion order. Mutations persist immediately unless a
//! transaction is open, in which case the file is rewritten once at
//! commit.

use crate::error::HistoryError;
use cascadefs_core::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Update channel a tag is bound to
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UpdateChannel {
    /// The default channel following the latest revision
    Trunk,
    /// Development snapshots
    Devel,
    /// Pre-production testing
    Test,
    /// Production releases
    Prod,
}

impl UpdateChannel {
    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            UpdateChannel::Trunk => "trunk",
            UpdateChannel::Devel => "devel",
            UpdateChannel::Test => "test",
            UpdateChannel::Prod => "prod",
        }
    }
}

/// A named pointer at a repository revision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique tag name
    pub name: String,
    /// Root catalog hash of the tagged revision
    pub root_hash: ContentHash,
    /// Size of the tagged root catalog in bytes
    pub size: u64,
    /// Repository revision number
    pub revision: u64,
    /// Tag timestamp, seconds since the Unix epoch
    pub timestamp: i64,
    /// Channel this tag belongs to
    pub channel: UpdateChannel,
    /// Free-form description
    pub description: String,
}

#[derive(Serialize, Deserialize)]
struct HistoryBody {
    fqrn: String,
    tags: Vec<Tag>,
}

/// The tag database of one repository
pub struct History {
    path: PathBuf,
    fqrn: String,
    tags: Vec<Tag>,
    writable: bool,
    in_transaction: bool,
}

impl History {
    /// Create a fresh, empty, writable database at `path`
    pub fn create(path: impl Into<PathBuf>, fqrn: impl Into<String>) -> Result<Self, HistoryError> {
        let history = Self {
            path: path.into(),
            fqrn: fqrn.into(),
            tags: Vec::new(),
            writable: true,
            in_transaction: false,
        };
        history.persist()?;
        info!(fqrn = %history.fqrn, path = %history.path.display(), "history database created");
        Ok(history)
    }

    /// Open an existing database read-only
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        Self::load(path.into(), false)
    }

    /// Open an existing database for writing
    pub fn open_writable(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        Self::load(path.into(), true)
    }

    fn load(path: PathBuf, writable: bool) -> Result<Self, HistoryError> {
        let bytes = std::fs::read(&path)?;
        let body: HistoryBody =
            bincode::deserialize(&bytes).map_err(|e| HistoryError::Encoding(e.to_string()))?;
        Ok(Self {
            path,
            fqrn: body.fqrn,
            tags: body.tags,
            writable,
            in_transaction: false,
        })
    }

    /// The fully qualified repository name this database belongs to
    pub fn fqrn(&self) -> &str {
        &self.fqrn
    }

    /// Where this database lives on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of tags
    pub fn count(&self) -> usize {
        self.tags.len()
    }

    /// Whether a tag with this name exists
    pub fn exists(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }

    /// Insert a new tag; the name must be unique
    pub fn insert(&mut self, tag: Tag) -> Result<(), HistoryError> {
        self.check_writable()?;
        if self.exists(&tag.name) {
            return Err(HistoryError::DuplicateTag(tag.name));
        }
        debug!(tag = %tag.name, revision = tag.revision, channel = tag.channel.name(), "tag inserted");
        self.tags.push(tag);
        self.persist_unless_in_transaction()
    }

    /// Remove a tag by name. Removing an absent name succeeds and changes
    /// nothing.
    pub fn remove(&mut self, name: &str) -> Result<(), HistoryError> {
        self.check_writable()?;
        let before = self.tags.len();
        self.tags.retain(|t| t.name != name);
        if self.tags.len() != before {
            debug!(tag = name, "tag removed");
        }
        self.persist_unless_in_transaction()
    }

    /// The tag with the given name, if any
    pub fn get_by_name(&self, name: &str) -> Option<Tag> {
        self.tags.iter().find(|t| t.name == name).cloned()
    }

    /// The tag with the greatest timestamp not after `timestamp`.
    /// Timestamp ties resolve to the greater revision.
    pub fn get_by_date(&self, timestamp: i64) -> Option<Tag> {
        self.tags
            .iter()
            .filter(|t| t.timestamp <= timestamp)
            .max_by_key(|t| (t.timestamp, t.revision))
            .cloned()
    }

    /// All tags ordered by descending revision; insertion order within a
    /// revision
    pub fn list(&self) -> Vec<Tag> {
        let mut tags = self.tags.clone();
        tags.sort_by(|a, b| b.revision.cmp(&a.revision));
        tags
    }

    /// For every channel present, the tag with the greatest revision.
    /// A revision tie resolves to the most recently inserted tag.
    pub fn tips(&self) -> Vec<Tag> {
        let mut tips: BTreeMap<UpdateChannel, &Tag> = BTreeMap::new();
        for tag in &self.tags {
            match tips.get(&tag.channel) {
                Some(current) if current.revision > tag.revision => {}
                _ => {
                    tips.insert(tag.channel, tag);
                }
            }
        }
        tips.into_values().cloned().collect()
    }

    /// Root hashes of all tags, in insertion order
    pub fn hashes(&self) -> Vec<ContentHash> {
        self.tags.iter().map(|t| t.root_hash).collect()
    }

    /// The tags a rollback to `target_name` would delete: every tag on
    /// the target's channel with a revision strictly above the target's,
    /// plus the target itself. A sibling sharing the target's revision
    /// survives. Ordered by descending revision; ties in unspecified
    /// order.
    pub fn list_tags_affected_by_rollback(
        &self,
        target_name: &str,
    ) -> Result<Vec<Tag>, HistoryError> {
        let target = self
            .get_by_name(target_name)
            .ok_or_else(|| HistoryError::TagNotFound(target_name.to_string()))?;
        let mut affected: Vec<Tag> = self
            .tags
            .iter()
            .filter(|t| {
                t.channel == target.channel
                    && (t.revision > target.revision || t.name == target_name)
            })
            .cloned()
            .collect();
        affected.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(affected)
    }

    /// Roll the target channel back: delete every affected tag (later
    /// revisions plus the target itself; a sibling sharing the target's
    /// revision survives) and insert `new_tag` in their place. The new
    /// tag must keep the rolled-back tag's name (a renamed tag is
    /// rejected, guarding against mistaken rewrites) and carry a
    /// revision above everything it deletes. Other channels are
    /// untouched.
    pub fn rollback(&mut self, new_tag: Tag) -> Result<(), HistoryError> {
        self.check_writable()?;
        let target = self
            .get_by_name(&new_tag.name)
            .ok_or_else(|| HistoryError::TagNotFound(new_tag.name.clone()))?;
        let max_affected = self
            .tags
            .iter()
            .filter(|t| {
                t.channel == target.channel
                    && (t.revision > target.revision || t.name == target.name)
            })
            .map(|t| t.revision)
            .max()
            .unwrap_or(target.revision);
        if new_tag.revision <= max_affected {
            return Err(HistoryError::RevisionNotNewer {
                new: new_tag.revision,
                max_affected,
            });
        }

        let before = self.tags.len();
        let channel = target.channel;
        let floor = target.revision;
        self.tags
            .retain(|t| !(t.channel == channel && (t.revision > floor || t.name == target.name)));
        info!(
            tag = %new_tag.name,
            channel = channel.name(),
            deleted = before - self.tags.len(),
            new_revision = new_tag.revision,
            "channel rolled back"
        );
        self.tags.push(new_tag);
        self.persist_unless_in_transaction()
    }

    /// Open a transaction: mutations accumulate in memory until commit
    pub fn begin_transaction(&mut self) -> Result<(), HistoryError> {
        self.check_writable()?;
        if self.in_transaction {
            return Err(HistoryError::TransactionActive);
        }
        self.in_transaction = true;
        Ok(())
    }

    /// Close the transaction and persist everything at once
    pub fn commit_transaction(&mut self) -> Result<(), HistoryError> {
        if !self.in_transaction {
            return Err(HistoryError::NoTransaction);
        }
        self.in_transaction = false;
        self.persist()
    }

    fn check_writable(&self) -> Result<(), HistoryError> {
        if self.writable {
            Ok(())
        } else {
            Err(HistoryError::ReadOnly)
        }
    }

    fn persist_unless_in_transaction(&self) -> Result<(), HistoryError> {
        if self.in_transaction {
            Ok(())
        } else {
            self.persist()
        }
    }

    fn persist(&self) -> Result<(), HistoryError> {
        let body = HistoryBody {
            fqrn: self.fqrn.clone(),
            tags: self.tags.clone(),
        };
        let bytes =
            bincode::serialize(&body).map_err(|e| HistoryError::Encoding(e.to_string()))?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}
