//! Per-file reconciliation between the processor and the uploader
//!
//! A `PendingFile` is born when a worker picks up a job and lives until the
//! user's completion callback has fired. The worker registers chunks while
//! upload continuations race in from the uploader thread; both sides funnel
//! through the internal mutex, and a `notified` sentinel guarantees the
//! callback fires exactly once.

use crate::uploader::ObjectName;
use cascadefs_core::chunker::FileChunk;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Upload progress of one staged chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkUploadState {
    /// Scheduled but not yet durable
    Pending,
    /// Durably stored
    Uploaded,
    /// Terminal failure reported by the uploader
    Failed,
}

/// A chunk staged in a temporary file, waiting to be stored under its
/// content hash
#[derive(Debug, Clone)]
pub struct TempChunk {
    /// The chunk descriptor (hash of the staged bytes, source range)
    pub chunk: FileChunk,
    /// Location of the staged compressed payload
    pub temp_path: PathBuf,
    /// Upload progress
    pub state: ChunkUploadState,
}

impl TempChunk {
    /// A freshly staged chunk in the pending state
    pub fn new(chunk: FileChunk, temp_path: PathBuf) -> Self {
        Self {
            chunk,
            temp_path,
            state: ChunkUploadState::Pending,
        }
    }
}

/// Final results for one processed file
#[derive(Debug, Clone)]
pub struct FileResults {
    /// 0 on success; the number of failed operations otherwise
    pub return_code: i32,
    /// The whole-file artifact, when one was produced or promoted
    pub bulk: Option<FileChunk>,
    /// Chunk descriptors in registration order; empty for unchunked files
    pub chunks: Vec<FileChunk>,
    /// The local file this job processed
    pub local_path: PathBuf,
}

impl FileResults {
    /// Whether the file was stored as multiple chunks
    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Whether every piece of the file is durably stored
    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// Completion callback invoked once per processed file
pub type CompletionCallback = Arc<dyn Fn(FileResults) + Send + Sync>;

struct Inner {
    chunks: Vec<TempChunk>,
    index_by_path: HashMap<PathBuf, usize>,
    bulk: Option<TempChunk>,
    chunks_uploaded: u32,
    errors: u32,
    processing_complete: bool,
    uploading_complete: bool,
    notified: bool,
}

impl Inner {
    fn registered_uploads(&self) -> u32 {
        self.chunks.len() as u32 + u32::from(self.bulk.is_some())
    }
}

/// Reconciliation record for one in-flight file
pub struct PendingFile {
    local_path: PathBuf,
    callback: CompletionCallback,
    inner: Mutex<Inner>,
}

impl PendingFile {
    /// Create the record for a freshly started job
    pub fn new(local_path: impl Into<PathBuf>, callback: CompletionCallback) -> Arc<Self> {
        Arc::new(Self {
            local_path: local_path.into(),
            callback,
            inner: Mutex::new(Inner {
                chunks: Vec::new(),
                index_by_path: HashMap::new(),
                bulk: None,
                chunks_uploaded: 0,
                errors: 0,
                processing_complete: false,
                uploading_complete: false,
                notified: false,
            }),
        })
    }

    /// The local file this record belongs to
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Register a partial chunk. Chunks are reported to the completion
    /// callback in registration order, regardless of upload order.
    pub fn add_chunk(&self, chunk: TempChunk) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        debug_assert!(!inner.processing_complete, "chunk added after finalize");
        let idx = inner.chunks.len();
        inner.index_by_path.insert(chunk.temp_path.clone(), idx);
        inner.chunks.push(chunk);
    }

    /// Register the whole-file bulk artifact. It is never counted among
    /// the chunk list.
    pub fn add_bulk(&self, chunk: TempChunk) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        debug_assert!(!inner.processing_complete, "bulk added after finalize");
        debug_assert!(inner.bulk.is_none(), "bulk registered twice");
        inner.bulk = Some(chunk);
    }

    /// If exactly one chunk was produced and no bulk exists, move that
    /// chunk into the bulk slot. Readers then fetch one object instead of
    /// a chunk list.
    pub fn promote_single_chunk_to_bulk(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.bulk.is_none() && inner.chunks.len() == 1 {
            let chunk = inner.chunks.pop().expect("length checked");
            inner.index_by_path.clear();
            debug!(path = %self.local_path.display(), "promoted single chunk to bulk");
            inner.bulk = Some(chunk);
        }
    }

    /// The uploads to schedule: every registered chunk plus the bulk, as
    /// (staged path, storage name) pairs
    pub fn upload_jobs(&self) -> Vec<(PathBuf, ObjectName)> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut jobs: Vec<(PathBuf, ObjectName)> = inner
            .chunks
            .iter()
            .map(|c| (c.temp_path.clone(), ObjectName::partial(c.chunk.hash)))
            .collect();
        if let Some(bulk) = &inner.bulk {
            jobs.push((bulk.temp_path.clone(), ObjectName::data(bulk.chunk.hash)));
        }
        jobs
    }

    /// Record a failure in the processing phase (mmap, compression,
    /// staging). Counts toward the error total; chunks registered before
    /// the failure still go through their uploads.
    pub fn record_processing_error(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.errors += 1;
    }

    /// Upload continuation entry point. Transitions the chunk (found by
    /// its staged path), updates the counters, and fires the completion
    /// callback when this was the last outstanding event.
    pub fn on_upload_complete(&self, temp_path: &Path, success: bool) {
        let results = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let state = if success {
                ChunkUploadState::Uploaded
            } else {
                ChunkUploadState::Failed
            };
            if let Some(&idx) = inner.index_by_path.get(temp_path) {
                inner.chunks[idx].state = state;
            } else if let Some(bulk) = inner
                .bulk
                .as_mut()
                .filter(|b| b.temp_path == temp_path)
            {
                bulk.state = state;
            } else {
                debug_assert!(false, "upload completion for unknown chunk");
                return;
            }

            inner.chunks_uploaded += 1;
            if !success {
                inner.errors += 1;
            }
            if inner.chunks_uploaded == inner.registered_uploads() {
                inner.uploading_complete = true;
            }
            self.take_results_if_complete(&mut inner)
        };
        if let Some(results) = results {
            (self.callback)(results);
        }
    }

    /// Called by the worker once every chunk of this file is registered
    /// and scheduled. Uploads may still be outstanding.
    pub fn finalize_processing(&self) {
        let results = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.processing_complete = true;
            if inner.chunks_uploaded == inner.registered_uploads() {
                inner.uploading_complete = true;
            }
            self.take_results_if_complete(&mut inner)
        };
        if let Some(results) = results {
            (self.callback)(results);
        }
    }

    /// Whether processing and every upload have terminated
    pub fn is_completed(&self) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.processing_complete && inner.uploading_complete
    }

    /// Whether the file completed without a single error
    pub fn is_completed_successfully(&self) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.processing_complete && inner.uploading_complete && inner.errors == 0
    }

    /// Completion predicate, checked under the lock on both flag
    /// transitions. The `notified` sentinel makes the callback fire once.
    fn take_results_if_complete(&self, inner: &mut Inner) -> Option<FileResults> {
        if inner.notified || !inner.processing_complete || !inner.uploading_complete {
            return None;
        }
        inner.notified = true;
        Some(FileResults {
            return_code: inner.errors as i32,
            bulk: inner.bulk.as_ref().map(|b| b.chunk),
            chunks: inner.chunks.iter().map(|c| c.chunk).collect(),
            local_path: self.local_path.clone(),
        })
    }
}
