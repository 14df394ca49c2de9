//! A single catalog: the entry database of one rooted subtree
//!
//! Rows are keyed by full path; the catalog's own root directory is a row
//! too (path equal to the mountpoint, `""` for the repository root). The
//! sealed form is a bincode body behind the repository codec; its digest
//! is the catalog's content name. Any mutation after sealing re-dirties
//! the catalog and clears that name.

use crate::entry::DirectoryEntry;
use crate::error::CatalogError;
use cascadefs_core::chunker::FileChunk;
use cascadefs_core::codec::{self, CompressionAlgorithm};
use cascadefs_core::hash::{ContentHash, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Join a parent directory path and a child name. The repository root is
/// the empty string, so `join_path("", "a")` is `/a`.
pub fn join_path(parent: &str, name: &str) -> String {
    format!("{parent}/{name}")
}

/// The parent directory of a path (`""` for top-level entries)
pub fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

/// The serialized payload of a sealed catalog
#[derive(Serialize, Deserialize)]
struct CatalogBody {
    mountpoint: String,
    revision: u64,
    entries: BTreeMap<String, DirectoryEntry>,
    chunks: BTreeMap<String, Vec<FileChunk>>,
    nested: BTreeMap<String, Option<ContentHash>>,
}

/// One catalog of the repository tree
#[derive(Debug, Clone)]
pub struct Catalog {
    mountpoint: String,
    revision: u64,
    entries: BTreeMap<String, DirectoryEntry>,
    chunks: BTreeMap<String, Vec<FileChunk>>,
    nested: BTreeMap<String, Option<ContentHash>>,
    dirty: bool,
    content_hash: Option<ContentHash>,
    sealed_size: u64,
}

impl Catalog {
    /// A fresh, empty, dirty catalog rooted at `mountpoint`
    pub fn new(mountpoint: impl Into<String>, revision: u64) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            revision,
            entries: BTreeMap::new(),
            chunks: BTreeMap::new(),
            nested: BTreeMap::new(),
            dirty: true,
            content_hash: None,
            sealed_size: 0,
        }
    }

    /// The path this catalog is rooted at (`""` for the repository root)
    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    /// The repository revision this catalog was last sealed for
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Stamp the catalog with the revision it is being sealed for
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Number of rows; the balancer's weight measure
    pub fn weight(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Whether the catalog has unsealed mutations
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The content name assigned at the last seal, if still valid
    pub fn content_hash(&self) -> Option<ContentHash> {
        self.content_hash
    }

    /// Size in bytes of the last sealed form
    pub fn sealed_size(&self) -> u64 {
        self.sealed_size
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.content_hash = None;
    }

    /// Whether this catalog contains `path` (deepest-prefix rule is the
    /// manager's job; this is a plain prefix check)
    pub fn contains_path(&self, path: &str) -> bool {
        path == self.mountpoint || path.starts_with(&format!("{}/", self.mountpoint))
    }

    /// Look up a row
    pub fn lookup(&self, path: &str) -> Option<&DirectoryEntry> {
        self.entries.get(path)
    }

    /// Insert a new row; fails if one already exists at `path`
    pub fn insert(&mut self, path: &str, entry: DirectoryEntry) -> Result<(), CatalogError> {
        if self.entries.contains_key(path) {
            return Err(CatalogError::EntryExists(path.to_string()));
        }
        self.entries.insert(path.to_string(), entry);
        self.touch();
        Ok(())
    }

    /// Replace an existing row; fails if none exists
    pub fn update(&mut self, path: &str, entry: DirectoryEntry) -> Result<(), CatalogError> {
        match self.entries.get_mut(path) {
            Some(slot) => {
                *slot = entry;
                self.touch();
                Ok(())
            }
            None => Err(CatalogError::EntryNotFound(path.to_string())),
        }
    }

    /// Remove a row (and its chunk list); fails if none exists
    pub fn remove(&mut self, path: &str) -> Result<DirectoryEntry, CatalogError> {
        match self.entries.remove(path) {
            Some(entry) => {
                self.chunks.remove(path);
                self.touch();
                Ok(entry)
            }
            None => Err(CatalogError::EntryNotFound(path.to_string())),
        }
    }

    /// Mutate a row in place via a closure
    pub fn modify<F>(&mut self, path: &str, f: F) -> Result<(), CatalogError>
    where
        F: FnOnce(&mut DirectoryEntry),
    {
        match self.entries.get_mut(path) {
            Some(entry) => {
                f(entry);
                self.touch();
                Ok(())
            }
            None => Err(CatalogError::EntryNotFound(path.to_string())),
        }
    }

    /// Immediate children of a directory, as (path, entry) pairs in path
    /// order
    pub fn children_of(&self, dir_path: &str) -> Vec<(&String, &DirectoryEntry)> {
        let prefix = format!("{dir_path}/");
        let upper = format!("{dir_path}0"); // '0' is '/' + 1
        self.entries
            .range(prefix.clone()..upper)
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .collect()
    }

    /// Whether a directory has any entries below it in this catalog
    pub fn has_descendants(&self, dir_path: &str) -> bool {
        let prefix = format!("{dir_path}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(path, _)| path.starts_with(&prefix))
    }

    /// All rows, in path order
    pub fn all_entries(&self) -> impl Iterator<Item = (&String, &DirectoryEntry)> {
        self.entries.iter()
    }

    /// Attach a chunk list to a file row
    pub fn set_chunks(&mut self, path: &str, chunks: Vec<FileChunk>) -> Result<(), CatalogError> {
        if !self.entries.contains_key(path) {
            return Err(CatalogError::EntryNotFound(path.to_string()));
        }
        self.chunks.insert(path.to_string(), chunks);
        self.touch();
        Ok(())
    }

    /// The chunk list of a file row, if any
    pub fn chunks_of(&self, path: &str) -> Option<&[FileChunk]> {
        self.chunks.get(path).map(Vec::as_slice)
    }

    /// Record a nested catalog pointer; the hash stays unset until the
    /// child is sealed
    pub fn register_nested(&mut self, mountpoint: &str) {
        self.nested.insert(mountpoint.to_string(), None);
        self.touch();
    }

    /// Drop a nested catalog pointer
    pub fn unregister_nested(&mut self, mountpoint: &str) {
        self.nested.remove(mountpoint);
        self.touch();
    }

    /// Update the stored hash of a nested catalog after it sealed
    pub fn set_nested_hash(&mut self, mountpoint: &str, hash: ContentHash) {
        self.nested.insert(mountpoint.to_string(), Some(hash));
        self.touch();
    }

    /// The recorded hash of a nested catalog, if it has been sealed
    pub fn nested_hash(&self, mountpoint: &str) -> Option<ContentHash> {
        self.nested.get(mountpoint).copied().flatten()
    }

    /// Whether a nested pointer exists for this mountpoint
    pub fn has_nested(&self, mountpoint: &str) -> bool {
        self.nested.contains_key(mountpoint)
    }

    /// Mountpoints of all registered nested catalogs, in path order
    pub fn nested_mountpoints(&self) -> Vec<String> {
        self.nested.keys().cloned().collect()
    }

    /// Move every row and chunk list strictly below `subtree` into
    /// `target`, together with nested pointers under that subtree
    pub fn drain_subtree_into(&mut self, subtree: &str, target: &mut Catalog) {
        let prefix = format!("{subtree}/");
        let moved_paths: Vec<String> = self
            .entries
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for path in &moved_paths {
            if let Some(entry) = self.entries.remove(path) {
                target.entries.insert(path.clone(), entry);
            }
            if let Some(chunks) = self.chunks.remove(path) {
                target.chunks.insert(path.clone(), chunks);
            }
        }
        let moved_nested: Vec<String> = self
            .nested
            .keys()
            .filter(|mp| mp.starts_with(&prefix))
            .cloned()
            .collect();
        for mp in moved_nested {
            let hash = self.nested.remove(&mp).flatten();
            target.nested.insert(mp, hash);
        }
        self.touch();
        target.touch();
    }

    /// Seal the catalog: serialize, compress, digest. Does not change the
    /// dirty state; the manager records the result via [`Catalog::mark_sealed`].
    pub fn seal(
        &self,
        hash_algorithm: HashAlgorithm,
        compression: CompressionAlgorithm,
    ) -> Result<(Vec<u8>, ContentHash), CatalogError> {
        let body = CatalogBody {
            mountpoint: self.mountpoint.clone(),
            revision: self.revision,
            entries: self.entries.clone(),
            chunks: self.chunks.clone(),
            nested: self.nested.clone(),
        };
        let encoded =
            bincode::serialize(&body).map_err(|e| CatalogError::Encoding(e.to_string()))?;
        let sealed = codec::compress(&encoded, compression)?;
        let hash = ContentHash::digest(hash_algorithm, &sealed);
        Ok((sealed, hash))
    }

    /// Record a successful seal: clean, named, sized
    pub fn mark_sealed(&mut self, hash: ContentHash, size: u64) {
        self.dirty = false;
        self.content_hash = Some(hash);
        self.sealed_size = size;
    }

    /// Reconstruct a catalog from its sealed bytes
    pub fn from_sealed(
        sealed: &[u8],
        compression: CompressionAlgorithm,
    ) -> Result<Self, CatalogError> {
        let encoded = codec::decompress(sealed, compression)?;
        let body: CatalogBody =
            bincode::deserialize(&encoded).map_err(|e| CatalogError::Encoding(e.to_string()))?;
        Ok(Self {
            mountpoint: body.mountpoint,
            revision: body.revision,
            entries: body.entries,
            chunks: body.chunks,
            nested: body.nested,
            dirty: false,
            content_hash: None,
            sealed_size: sealed.len() as u64,
        })
    }
}
