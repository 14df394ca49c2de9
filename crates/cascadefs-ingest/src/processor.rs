//! The concurrent file processor
//!
//! A pool of worker threads drains a job queue. Each job maps one local
//! file, cuts it into content-defined chunks (or a single bulk piece),
//! compresses and hashes every piece into the staging directory, and
//! schedules the uploads. Reconciliation and the exactly-once completion
//! callback live in [`PendingFile`](crate::pending::PendingFile).

use crate::error::IngestError;
use crate::pending::{CompletionCallback, FileResults, PendingFile, TempChunk};
use crate::uploader::Uploader;
use cascadefs_core::chunker::{Chunker, ChunkerConfig, FileChunk, Span};
use cascadefs_core::codec::{self, CompressionAlgorithm};
use cascadefs_core::config::PublishParams;
use cascadefs_core::hash::{ContentHash, HashAlgorithm};
use crossbeam_channel::{unbounded, Sender};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Configuration of the file processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Staging directory for compressed chunks, exclusive to one publish
    /// session
    pub temp_dir: PathBuf,
    /// Digest algorithm for chunk names
    pub hash_algorithm: HashAlgorithm,
    /// Codec applied to every piece before hashing
    pub compression: CompressionAlgorithm,
    /// Master chunking enable; individual jobs may still opt out
    pub use_file_chunking: bool,
    /// Emit a whole-file artifact alongside chunks for legacy readers
    pub generate_legacy_bulk_chunks: bool,
    /// Chunker bounds
    pub chunker: ChunkerConfig,
    /// Worker threads; 0 means one per CPU
    pub worker_count: usize,
}

impl ProcessorConfig {
    /// Derive a processor configuration from parsed publish parameters
    pub fn from_params(
        params: &PublishParams,
        temp_dir: impl Into<PathBuf>,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            temp_dir: temp_dir.into(),
            hash_algorithm: params.hash_algorithm,
            compression: params.compression,
            use_file_chunking: params.use_file_chunking,
            generate_legacy_bulk_chunks: params.generate_legacy_bulk_chunks,
            chunker: params.chunker_config()?,
            worker_count: 0,
        })
    }
}

struct Job {
    local_path: PathBuf,
    allow_chunking: bool,
}

struct Shared {
    config: ProcessorConfig,
    chunker: Chunker,
    uploader: Arc<dyn Uploader>,
    user_callback: CompletionCallback,
    pending: Mutex<HashMap<PathBuf, Arc<PendingFile>>>,
    // Jobs submitted but not yet notified; drives wait_idle. Counted at
    // submit time so a wait cannot slip between enqueue and pickup.
    outstanding: Mutex<usize>,
    idle: Condvar,
}

/// Concurrent per-file pipeline: chunk, compress, hash, upload, reconcile
pub struct FileProcessor {
    jobs_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl FileProcessor {
    /// Spawn the worker pool. The completion callback runs once per
    /// submitted file, on a worker or uploader thread.
    pub fn new(
        config: ProcessorConfig,
        uploader: Arc<dyn Uploader>,
        callback: impl Fn(FileResults) + Send + Sync + 'static,
    ) -> Result<Self, IngestError> {
        let chunker = Chunker::new(config.chunker)?;
        std::fs::create_dir_all(&config.temp_dir)
            .map_err(|e| IngestError::io(&config.temp_dir, e))?;

        let worker_count = if config.worker_count == 0 {
            num_cpus::get()
        } else {
            config.worker_count
        };

        let shared = Arc::new(Shared {
            config,
            chunker,
            uploader,
            user_callback: Arc::new(callback),
            pending: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });

        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = jobs_rx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("cascadefs-ingest-{i}"))
                .spawn(move || {
                    for job in rx {
                        process_job(Arc::clone(&shared), job);
                    }
                })
                .map_err(|e| IngestError::io("worker spawn", e))?;
            workers.push(handle);
        }

        Ok(Self {
            jobs_tx: Some(jobs_tx),
            workers,
            shared,
        })
    }

    /// Submit one file for processing
    pub fn process(
        &self,
        local_path: impl Into<PathBuf>,
        allow_chunking: bool,
    ) -> Result<(), IngestError> {
        let job = Job {
            local_path: local_path.into(),
            allow_chunking,
        };
        *self.shared.outstanding.lock().expect("lock poisoned") += 1;
        let sent = self
            .jobs_tx
            .as_ref()
            .ok_or(IngestError::ShutDown)
            .and_then(|tx| tx.send(job).map_err(|_| IngestError::ShutDown));
        if sent.is_err() {
            *self.shared.outstanding.lock().expect("lock poisoned") -= 1;
        }
        sent
    }

    /// Block until every submitted file has completed (callback fired)
    pub fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.lock().expect("lock poisoned");
        while *outstanding > 0 {
            outstanding = self.shared.idle.wait(outstanding).expect("lock poisoned");
        }
    }

    /// Number of files currently in flight
    pub fn in_flight(&self) -> usize {
        *self.shared.outstanding.lock().expect("lock poisoned")
    }
}

impl Drop for FileProcessor {
    fn drop(&mut self) {
        drop(self.jobs_tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// A mapped input file. Empty files cannot be mapped and fall back to an
/// empty buffer.
enum MappedFile {
    Mapped(Mmap),
    Empty,
}

impl MappedFile {
    fn open(file: &File, len: u64) -> std::io::Result<Self> {
        if len == 0 {
            Ok(MappedFile::Empty)
        } else {
            // Safety: publish sessions own their input tree; files are not
            // mutated while mapped.
            let mmap = unsafe { Mmap::map(file)? };
            Ok(MappedFile::Mapped(mmap))
        }
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MappedFile::Mapped(mmap) => mmap,
            MappedFile::Empty => &[],
        }
    }
}

fn process_job(shared: Arc<Shared>, job: Job) {
    let local_path = job.local_path.clone();
    let shared_for_callback = Arc::clone(&shared);
    let path_for_callback = local_path.clone();
    let callback: CompletionCallback = Arc::new(move |results: FileResults| {
        (shared_for_callback.user_callback)(results);
        shared_for_callback
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(&path_for_callback);
        *shared_for_callback
            .outstanding
            .lock()
            .expect("lock poisoned") -= 1;
        shared_for_callback.idle.notify_all();
    });

    let pending_file = PendingFile::new(&local_path, callback);
    shared
        .pending
        .lock()
        .expect("lock poisoned")
        .insert(local_path.clone(), Arc::clone(&pending_file));

    if let Err(err) = run_pipeline(&shared, &job, &pending_file) {
        warn!(path = %local_path.display(), error = %err, "file processing failed");
        pending_file.record_processing_error();
    }
    // Chunks staged before a failure still get their uploads: the
    // completion accounting needs every registered chunk to terminate,
    // and the stored objects are content-addressed anyway.
    submit_uploads(&*shared.uploader, &pending_file);
    pending_file.finalize_processing();
}

fn run_pipeline(
    shared: &Shared,
    job: &Job,
    pending: &Arc<PendingFile>,
) -> Result<(), IngestError> {
    let config = &shared.config;
    let file =
        File::open(&job.local_path).map_err(|e| IngestError::io(&job.local_path, e))?;
    let size = file
        .metadata()
        .map_err(|e| IngestError::io(&job.local_path, e))?
        .len();
    let mapped =
        MappedFile::open(&file, size).map_err(|e| IngestError::io(&job.local_path, e))?;

    let apply_chunking =
        job.allow_chunking && config.use_file_chunking && size > config.chunker.min_size;

    if apply_chunking {
        let spans = shared.chunker.chunks(&mapped);
        debug!(
            path = %job.local_path.display(),
            size,
            chunks = spans.len(),
            "file chunked"
        );
        for span in spans {
            let staged = stage_span(shared, job, &mapped, span)?;
            pending.add_chunk(staged);
        }
        if config.generate_legacy_bulk_chunks {
            let whole = Span {
                offset: 0,
                size,
            };
            let staged = stage_span(shared, job, &mapped, whole)?;
            pending.add_bulk(staged);
        }
        pending.promote_single_chunk_to_bulk();
    } else {
        let whole = Span { offset: 0, size };
        let staged = stage_span(shared, job, &mapped, whole)?;
        pending.add_bulk(staged);
    }
    Ok(())
}

/// Schedule an upload for every chunk registered so far. Runs for failed
/// jobs too, so each registered chunk terminates and the pending file can
/// reach completion.
fn submit_uploads(uploader: &dyn Uploader, pending: &Arc<PendingFile>) {
    for (temp_path, name) in pending.upload_jobs() {
        let pending = Arc::clone(pending);
        let path_key = temp_path.clone();
        uploader.upload(
            temp_path,
            name,
            Box::new(move |outcome| {
                pending.on_upload_complete(&path_key, outcome.is_success());
            }),
        );
    }
}

/// Compress one span into a fresh staging file and hash the stored bytes.
/// The chunk's identity is the digest of the compressed payload.
fn stage_span(
    shared: &Shared,
    job: &Job,
    data: &[u8],
    span: Span,
) -> Result<TempChunk, IngestError> {
    let config = &shared.config;
    let slice = &data[span.offset as usize..(span.offset + span.size) as usize];
    let compressed = codec::compress(slice, config.compression)?;
    let hash = ContentHash::digest(config.hash_algorithm, &compressed);

    let mut staged = tempfile::NamedTempFile::new_in(&config.temp_dir)
        .map_err(|e| IngestError::io(&config.temp_dir, e))?;
    staged
        .write_all(&compressed)
        .map_err(|e| IngestError::io(staged.path(), e))?;
    let (_, temp_path) = staged
        .keep()
        .map_err(|e| IngestError::io(&job.local_path, e.error))?;

    Ok(TempChunk::new(
        FileChunk {
            hash,
            offset: span.offset,
            size: span.size,
        },
        temp_path,
    ))
}
