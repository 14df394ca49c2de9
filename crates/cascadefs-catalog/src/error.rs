//! Error types for the cascadefs-catalog crate

use cascadefs_core::CoreError;

/// All errors produced by catalog mutations and snapshots
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No entry exists at the given path
    #[error("no entry at '{0}'")]
    EntryNotFound(String),

    /// An entry already exists at the given path
    #[error("entry already exists at '{0}'")]
    EntryExists(String),

    /// The parent directory of a mutation target does not exist
    #[error("parent directory '{0}' not found")]
    ParentNotFound(String),

    /// The path names something other than a directory
    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    /// The path names something other than a regular file
    #[error("'{0}' is not a regular file")]
    NotAFile(String),

    /// Attempted to remove a directory that still has entries
    #[error("directory '{0}' is not empty")]
    DirectoryNotEmpty(String),

    /// The path is already a nested catalog mountpoint
    #[error("'{0}' is already a nested catalog mountpoint")]
    AlreadyMountpoint(String),

    /// The path is not a nested catalog mountpoint
    #[error("'{0}' is not a nested catalog mountpoint")]
    NotAMountpoint(String),

    /// The entry is not part of a hardlink group
    #[error("'{0}' is not part of a hardlink group")]
    NotInHardlinkGroup(String),

    /// A parent's mountpoint row and the child's root row disagree
    #[error("transition point mismatch at '{0}'")]
    TransitionPointMismatch(String),

    /// Storing a sealed catalog failed
    #[error("catalog upload failed: {0}")]
    UploadFailed(String),

    /// Serializing or deserializing a catalog body failed
    #[error("catalog encoding failed: {0}")]
    Encoding(String),

    /// Invalid configuration or codec failure from the core crate
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A lower-level I/O error occurred
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
