//! Error types for the cascadefs-core crate

/// All errors produced by the core value types and parsers
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Chunker size constraints violated (min <= avg <= max, avg a power of two)
    #[error("invalid chunker bounds: min={min} avg={avg} max={max} ({reason})")]
    ChunkerBounds {
        /// Configured minimum chunk size
        min: u64,
        /// Configured average chunk size
        avg: u64,
        /// Configured maximum chunk size
        max: u64,
        /// Which constraint failed
        reason: &'static str,
    },

    /// A required configuration key is absent from server.conf
    #[error("missing required configuration key {0}")]
    ConfigMissingKey(&'static str),

    /// A configuration value could not be parsed
    #[error("invalid value '{value}' for configuration key {key}")]
    ConfigInvalidValue {
        /// The offending key
        key: &'static str,
        /// The raw value as read from the file
        value: String,
    },

    /// Gateway upstreams are not served by this publisher
    #[error("gateway upstream '{0}' is not supported here")]
    GatewayUpstream(String),

    /// Unrecognized hash algorithm name
    #[error("unknown hash algorithm '{0}'")]
    UnknownHashAlgorithm(String),

    /// Unrecognized compression algorithm name
    #[error("unknown compression algorithm '{0}'")]
    UnknownCompression(String),

    /// A content hash string failed to parse
    #[error("malformed content hash '{0}'")]
    MalformedHash(String),

    /// A manifest line failed to parse
    #[error("malformed manifest field '{0}'")]
    MalformedManifest(String),

    /// A lower-level I/O error occurred
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
