//! Error types for the cascadefs-ingest crate

use cascadefs_core::CoreError;

/// All errors produced while ingesting files
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Invalid chunker bounds or other core-level configuration problem
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Reading, mapping, or staging a file failed
    #[error("io failure on {path}: {source}")]
    Io {
        /// The file being processed when the failure occurred
        path: std::path::PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// The spooler definition could not be understood
    #[error("malformed spooler definition '{0}'")]
    MalformedSpoolerDefinition(String),

    /// The processor is shutting down and accepts no further jobs
    #[error("file processor is shut down")]
    ShutDown,
}

impl IngestError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }
}
