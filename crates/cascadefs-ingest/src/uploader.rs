//! The abstract uploader: asynchronous durable storage of staged files
//! under their content-hash names
//!
//! `upload` returns immediately; the completion continuation runs on an
//! uploader-owned thread once the object is durable (or has failed).
//! Retries, if any, live inside a backend. Two backends are provided: a
//! local-disk spooler and an in-memory recorder for tests.

use crate::error::IngestError;
use cascadefs_core::hash::{ContentHash, StorageSuffix};
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Storage name of an uploaded object: content hash plus flavor suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectName {
    /// Content hash of the stored bytes
    pub hash: ContentHash,
    /// Storage flavor
    pub suffix: StorageSuffix,
}

impl ObjectName {
    /// Name for a whole-file (bulk) data blob
    pub fn data(hash: ContentHash) -> Self {
        Self {
            hash,
            suffix: StorageSuffix::Data,
        }
    }

    /// Name for a partial file chunk
    pub fn partial(hash: ContentHash) -> Self {
        Self {
            hash,
            suffix: StorageSuffix::Partial,
        }
    }

    /// Name for a sealed catalog
    pub fn catalog(hash: ContentHash) -> Self {
        Self {
            hash,
            suffix: StorageSuffix::Catalog,
        }
    }

    /// Repository-relative storage path: `data/<2 hex>/<38 hex><suffix>`
    pub fn relative_path(&self) -> PathBuf {
        let hex = self.hash.to_hex();
        PathBuf::from(format!(
            "data/{}/{}{}",
            &hex[..2],
            &hex[2..],
            self.suffix.as_str()
        ))
    }

    /// Flat string form, used as a map key by the in-memory backend
    pub fn to_key(&self) -> String {
        self.hash.to_string_suffixed(self.suffix)
    }
}

/// Outcome handed to an upload continuation
#[derive(Debug)]
pub struct UploadOutcome {
    /// The object that was being stored
    pub name: ObjectName,
    /// The staged source file
    pub source: PathBuf,
    /// Ok once durable; the error text otherwise
    pub result: Result<(), String>,
}

impl UploadOutcome {
    /// Whether the object is durably stored
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Continuation invoked exactly once per upload job
pub type UploadCallback = Box<dyn FnOnce(UploadOutcome) + Send + 'static>;

/// Asynchronous store of staged local files under content-hash names
pub trait Uploader: Send + Sync {
    /// Schedule `source` to be stored as `name`. Returns immediately; the
    /// continuation runs on an uploader-owned thread. The source file is
    /// consumed (moved or deleted) on success.
    fn upload(&self, source: PathBuf, name: ObjectName, on_done: UploadCallback);

    /// Block until every scheduled upload has terminated
    fn wait_idle(&self);
}

struct LocalJob {
    source: PathBuf,
    name: ObjectName,
    on_done: UploadCallback,
}

/// Spooler backend writing into a local repository tree
#[derive(Debug)]
pub struct LocalUploader {
    tx: Option<Sender<LocalJob>>,
    worker: Option<JoinHandle<()>>,
    inflight: Arc<(Mutex<usize>, Condvar)>,
    root: PathBuf,
}

impl LocalUploader {
    /// Create a spooler rooted at `root`; objects land under `root/data/`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(root.join("data")).map_err(|e| IngestError::io(&root, e))?;

        let inflight = Arc::new((Mutex::new(0usize), Condvar::new()));
        let (tx, rx) = unbounded::<LocalJob>();
        let worker_root = root.clone();
        let worker_inflight = Arc::clone(&inflight);
        let worker = std::thread::Builder::new()
            .name("cascadefs-spooler".into())
            .spawn(move || {
                for job in rx {
                    let result = store_object(&worker_root, &job.source, &job.name)
                        .map_err(|e| e.to_string());
                    if let Err(err) = &result {
                        warn!(object = %job.name.to_key(), error = %err, "upload failed");
                    } else {
                        debug!(object = %job.name.to_key(), "object stored");
                    }
                    (job.on_done)(UploadOutcome {
                        name: job.name,
                        source: job.source,
                        result,
                    });
                    let (count, cvar) = &*worker_inflight;
                    *count.lock().expect("lock poisoned") -= 1;
                    cvar.notify_all();
                }
            })
            .map_err(|e| IngestError::io(&root, e))?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            inflight,
            root,
        })
    }

    /// Build from a spooler definition of the form `local,<txn dir>,<root>`
    pub fn from_definition(definition: &str) -> Result<Self, IngestError> {
        let mut parts = definition.split(',');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("local"), Some(_txn), Some(root)) => Self::new(root),
            _ => Err(IngestError::MalformedSpoolerDefinition(
                definition.to_string(),
            )),
        }
    }

    /// The repository root this spooler writes into
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Uploader for LocalUploader {
    fn upload(&self, source: PathBuf, name: ObjectName, on_done: UploadCallback) {
        let (count, _) = &*self.inflight;
        *count.lock().expect("lock poisoned") += 1;
        let tx = self.tx.as_ref().expect("uploader already shut down");
        tx.send(LocalJob {
            source,
            name,
            on_done,
        })
        .expect("spooler worker gone");
    }

    fn wait_idle(&self) {
        let (count, cvar) = &*self.inflight;
        let mut guard = count.lock().expect("lock poisoned");
        while *guard > 0 {
            guard = cvar.wait(guard).expect("lock poisoned");
        }
    }
}

impl Drop for LocalUploader {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Move a staged file into its content-addressed location. Identical
/// content coalesces: an existing object is kept and the stage discarded.
fn store_object(root: &Path, source: &Path, name: &ObjectName) -> std::io::Result<()> {
    let target = root.join(name.relative_path());
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if target.exists() {
        std::fs::remove_file(source)?;
        return Ok(());
    }
    match std::fs::rename(source, &target) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device stage directory; fall back to copy + unlink.
            std::fs::copy(source, &target)?;
            std::fs::remove_file(source)
        }
    }
}

/// In-memory uploader for tests: records every stored object and can
/// inject failures. Continuations run synchronously on the caller thread.
#[derive(Default)]
pub struct MemoryUploader {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_next: Mutex<usize>,
}

impl MemoryUploader {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` uploads with an injected error
    pub fn fail_next(&self, count: usize) {
        *self.fail_next.lock().expect("lock poisoned") = count;
    }

    /// Bytes stored under the given object name, if any
    pub fn get(&self, name: &ObjectName) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .expect("lock poisoned")
            .get(&name.to_key())
            .cloned()
    }

    /// Whether an object with this name was stored
    pub fn contains(&self, name: &ObjectName) -> bool {
        self.blobs
            .lock()
            .expect("lock poisoned")
            .contains_key(&name.to_key())
    }

    /// Number of distinct stored objects
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("lock poisoned").len()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored object keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl Uploader for MemoryUploader {
    fn upload(&self, source: PathBuf, name: ObjectName, on_done: UploadCallback) {
        let inject_failure = {
            let mut fail = self.fail_next.lock().expect("lock poisoned");
            if *fail > 0 {
                *fail -= 1;
                true
            } else {
                false
            }
        };

        let result = if inject_failure {
            Err("injected upload failure".to_string())
        } else {
            match std::fs::read(&source) {
                Ok(bytes) => {
                    self.blobs
                        .lock()
                        .expect("lock poisoned")
                        .insert(name.to_key(), bytes);
                    let _ = std::fs::remove_file(&source);
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        };

        on_done(UploadOutcome {
            name,
            source,
            result,
        });
    }

    fn wait_idle(&self) {}
}
