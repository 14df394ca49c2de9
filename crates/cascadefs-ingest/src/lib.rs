#![warn(missing_docs)]

//! CascadeFS file ingestion: the concurrent write path that turns local
//! files into content-addressed, compressed chunks in durable storage.
//!
//! A [`FileProcessor`] worker pool maps each file, splits it with the
//! content-defined chunker, compresses and hashes every piece into a
//! temporary file, and hands the pieces to an [`Uploader`]. A per-file
//! [`PendingFile`] record reconciles upload completions and fires the
//! user's completion callback exactly once per submitted file.

pub mod error;
pub mod pending;
pub mod processor;
pub mod uploader;

pub use error::IngestError;
pub use pending::{ChunkUploadState, CompletionCallback, FileResults, PendingFile, TempChunk};
pub use processor::{FileProcessor, ProcessorConfig};
pub use uploader::{LocalUploader, MemoryUploader, ObjectName, UploadOutcome, Uploader};
