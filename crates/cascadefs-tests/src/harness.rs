//! Shared scaffolding for publish-cycle tests

use cascadefs_catalog::{ManagerConfig, WritableCatalogManager};
use cascadefs_core::chunker::ChunkerConfig;
use cascadefs_core::codec::CompressionAlgorithm;
use cascadefs_core::hash::HashAlgorithm;
use cascadefs_ingest::processor::{FileProcessor, ProcessorConfig};
use cascadefs_ingest::uploader::{MemoryUploader, Uploader};
use cascadefs_ingest::FileResults;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// One publish session against an in-memory store: input tree, staging
/// directory, shared uploader, catalog manager
pub struct PublishEnv {
    /// Input files live here
    pub input: TempDir,
    /// Chunk and catalog staging
    pub staging: TempDir,
    /// The shared object store
    pub uploader: Arc<MemoryUploader>,
    /// The catalog tree under construction
    pub manager: WritableCatalogManager,
}

impl PublishEnv {
    /// A fresh environment named `repo`
    pub fn new(repo: &str) -> Self {
        let input = tempfile::tempdir().expect("input dir");
        let staging = tempfile::tempdir().expect("staging dir");
        let uploader = Arc::new(MemoryUploader::new());
        let manager = WritableCatalogManager::new(
            ManagerConfig::new(repo, staging.path().join("catalogs")),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
        )
        .expect("manager");
        Self {
            input,
            staging,
            uploader,
            manager,
        }
    }

    /// Small-bounds chunker so modest fixtures actually chunk
    pub fn chunker_config() -> ChunkerConfig {
        ChunkerConfig {
            min_size: 4 * 1024,
            avg_size: 8 * 1024,
            max_size: 16 * 1024,
        }
    }

    /// A processor configuration staging into this environment
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            temp_dir: self.staging.path().join("chunks"),
            hash_algorithm: HashAlgorithm::Sha1,
            compression: CompressionAlgorithm::Zlib,
            use_file_chunking: true,
            generate_legacy_bulk_chunks: false,
            chunker: Self::chunker_config(),
            worker_count: 2,
        }
    }

    /// Write an input file and return its path
    pub fn write_input(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.input.path().join(name);
        std::fs::write(&path, contents).expect("write input");
        path
    }

    /// Process the given files and collect their results
    pub fn process_files(&self, paths: &[(PathBuf, bool)]) -> Vec<FileResults> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let processor = FileProcessor::new(
            self.processor_config(),
            Arc::clone(&self.uploader) as Arc<dyn Uploader>,
            move |results| {
                tx.send(results).expect("results channel");
            },
        )
        .expect("processor");
        for (path, allow_chunking) in paths {
            processor.process(path, *allow_chunking).expect("submit");
        }
        processor.wait_idle();
        drop(processor);
        rx.iter().collect()
    }
}

/// Install a compact subscriber so failing runs show the publish flow;
/// safe to call from every test
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Deterministic pseudo-random bytes for chunkable fixtures
pub fn noisy_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed = seed
            .wrapping_mul(0x5851_f42d_4c95_7f2d)
            .wrapping_add(0x1405_7b7e_f767_814f);
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// The file name component of a path
pub fn file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .expect("utf8 file name")
}
