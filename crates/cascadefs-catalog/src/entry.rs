//! Directory entries: the rows of a catalog
//!
//! An entry carries plain filesystem metadata plus the CascadeFS-specific
//! fields: the content hash of regular files, the chunked flag, extended
//! attributes, and the nested-catalog markers. Paths are not stored in the
//! entry; the catalog keys its rows by full path.

use cascadefs_core::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of filesystem object an entry describes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

/// One catalog row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Final path component
    pub name: String,
    /// Object kind
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Hard link count
    pub link_count: u32,
    /// Hardlink group id; 0 means not part of a group
    pub hardlink_group: u32,
    /// Symlink target (symlinks only)
    pub symlink_target: Option<String>,
    /// Content hash of the stored bulk blob (regular files)
    pub content_hash: Option<ContentHash>,
    /// Extended attributes
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// This row references a nested catalog in a child
    pub is_nested_mountpoint: bool,
    /// This row is the root of its own catalog
    pub is_nested_root: bool,
    /// The file is stored as a chunk list rather than one blob
    pub is_chunked: bool,
    /// Hidden from listings
    pub is_hidden: bool,
}

impl DirectoryEntry {
    /// A regular file row
    pub fn new_file(name: &str, size: u64, mode: u32, uid: u32, gid: u32, mtime: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::File,
            mode,
            mtime,
            uid,
            gid,
            size,
            link_count: 1,
            hardlink_group: 0,
            symlink_target: None,
            content_hash: None,
            xattrs: BTreeMap::new(),
            is_nested_mountpoint: false,
            is_nested_root: false,
            is_chunked: false,
            is_hidden: false,
        }
    }

    /// A directory row
    pub fn new_directory(name: &str, mode: u32, uid: u32, gid: u32, mtime: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::Directory,
            mode,
            mtime,
            uid,
            gid,
            size: 0,
            link_count: 2,
            hardlink_group: 0,
            symlink_target: None,
            content_hash: None,
            xattrs: BTreeMap::new(),
            is_nested_mountpoint: false,
            is_nested_root: false,
            is_chunked: false,
            is_hidden: false,
        }
    }

    /// A symlink row
    pub fn new_symlink(name: &str, target: &str, uid: u32, gid: u32, mtime: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::Symlink,
            mode: 0o777,
            mtime,
            uid,
            gid,
            size: target.len() as u64,
            link_count: 1,
            hardlink_group: 0,
            symlink_target: Some(target.to_string()),
            content_hash: None,
            xattrs: BTreeMap::new(),
            is_nested_mountpoint: false,
            is_nested_root: false,
            is_chunked: false,
            is_hidden: false,
        }
    }

    /// Whether this row describes a directory
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether this row describes a regular file
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Whether this row sits on a catalog boundary (either side)
    pub fn is_transition_point(&self) -> bool {
        self.is_nested_mountpoint || self.is_nested_root
    }

    /// Metadata equality across a catalog boundary: a parent's mountpoint
    /// row and the child's root row must agree on these fields.
    pub fn transition_metadata_matches(&self, other: &DirectoryEntry) -> bool {
        self.name == other.name
            && self.mode == other.mode
            && self.mtime == other.mtime
            && self.uid == other.uid
            && self.gid == other.gid
            && self.content_hash.is_none()
            && other.content_hash.is_none()
    }
}
