#![warn(missing_docs)]

//! CascadeFS publisher core types: content hashes, the zlib codec, the
//! content-defined chunker, publish parameters, and the repository manifest.
//!
//! Everything in this crate is a leaf: no I/O threads, no catalogs, no
//! uploaders. The ingest, catalog, history, and receiver crates build on
//! these value types.

pub mod chunker;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;

pub use chunker::{Chunker, ChunkerConfig, FileChunk, Span};
pub use codec::CompressionAlgorithm;
pub use config::PublishParams;
pub use error::CoreError;
pub use hash::{ContentHash, HashAlgorithm, StorageSuffix};
pub use manifest::Manifest;
