//! Zlib compression/decompression for stored objects
//!
//! The wire format knows exactly two flavors: zlib and passthrough. Chunks,
//! sealed catalogs, and history databases all go through this codec before
//! they are hashed and stored.

use crate::error::CoreError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// Zlib deflate, the repository default
    #[default]
    Zlib,
    /// No compression (passthrough)
    None,
}

impl CompressionAlgorithm {
    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::None => "none",
        }
    }

    /// Parse a configuration value
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zlib" | "default" => Ok(CompressionAlgorithm::Zlib),
            "none" => Ok(CompressionAlgorithm::None),
            other => Err(CoreError::UnknownCompression(other.to_string())),
        }
    }
}

/// Compress data with the given algorithm. Returns the stored bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, CoreError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompress stored bytes using the algorithm they were stored with.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, CoreError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zlib => {
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}
