//! Error types for the cascadefs-history crate

/// All errors produced by the tag database
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// A tag with this name already exists
    #[error("tag '{0}' already exists")]
    DuplicateTag(String),

    /// No tag with this name exists
    #[error("tag '{0}' not found")]
    TagNotFound(String),

    /// A rollback tag must carry a revision above everything it replaces
    #[error("rollback revision {new} does not supersede revision {max_affected}")]
    RevisionNotNewer {
        /// Revision of the replacement tag
        new: u64,
        /// Greatest revision among the affected tags
        max_affected: u64,
    },

    /// The database was opened read-only
    #[error("history database is read-only")]
    ReadOnly,

    /// A transaction is already active
    #[error("transaction already active")]
    TransactionActive,

    /// No transaction is active
    #[error("no active transaction")]
    NoTransaction,

    /// Serializing or deserializing the database failed
    #[error("history encoding failed: {0}")]
    Encoding(String),

    /// A lower-level I/O error occurred
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
