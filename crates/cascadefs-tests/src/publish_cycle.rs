//! Whole publish cycles: processor output feeding the catalog manager,
//! commits producing manifests, revisions landing in the history log

use crate::harness::{file_name, noisy_bytes, PublishEnv};
use cascadefs_catalog::{Catalog, DirectoryEntry};
use cascadefs_core::codec::{self, CompressionAlgorithm};
use cascadefs_history::{History, Tag, UpdateChannel};
use cascadefs_ingest::uploader::ObjectName;
use cascadefs_ingest::FileResults;

fn dir(name: &str) -> DirectoryEntry {
    DirectoryEntry::new_directory(name, 0o755, 0, 0, 1000)
}

/// Record one processor result under `parent_dir` in the catalog tree
fn record_result(env: &PublishEnv, results: &FileResults, parent_dir: &str) {
    let name = file_name(&results.local_path);
    let size = std::fs::metadata(&results.local_path).unwrap().len();
    let mut entry = DirectoryEntry::new_file(name, size, 0o644, 0, 0, 1000);
    if results.is_chunked() {
        env.manager
            .add_chunked_file(entry, parent_dir, results.chunks.clone())
            .unwrap();
    } else {
        entry.content_hash = Some(results.bulk.unwrap().hash);
        env.manager.add_file(entry, parent_dir).unwrap();
    }
}

#[test]
fn publish_cycle_end_to_end() {
    crate::harness::init_test_logging();
    let env = PublishEnv::new("alpha.example.org");

    // An input tree with one chunkable file and two small ones.
    let big = env.write_input("dataset.bin", &noisy_bytes(120 * 1024, 7));
    let small = env.write_input("readme.txt", b"hello cascadefs");
    let exact = env.write_input("config.bin", &noisy_bytes(1024, 9));

    let results = env.process_files(&[
        (big.clone(), true),
        (small.clone(), true),
        (exact.clone(), true),
    ]);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.is_success()));

    // Namespace: /data holds everything.
    env.manager.add_directory(dir("data"), "").unwrap();
    for r in &results {
        record_result(&env, r, "/data");
    }

    let manifest = env.manager.commit(None).unwrap();
    assert_eq!(manifest.revision, 1);
    assert_eq!(manifest.repo_name, "alpha.example.org");

    // The sealed root catalog is in the store and decodes to the
    // namespace we built.
    let sealed = env
        .uploader
        .get(&ObjectName::catalog(manifest.root_hash))
        .unwrap();
    assert_eq!(sealed.len() as u64, manifest.root_size);
    let root = Catalog::from_sealed(&sealed, CompressionAlgorithm::Zlib).unwrap();
    assert!(root.lookup("/data").unwrap().is_directory());
    let big_entry = root.lookup("/data/dataset.bin").unwrap();
    assert!(big_entry.is_chunked);
    let chunk_rows = root.chunks_of("/data/dataset.bin").unwrap();
    assert!(!chunk_rows.is_empty());

    // Every chunk the catalog references is durably stored, and
    // decompressing them reassembles the input exactly.
    let mut reassembled = Vec::new();
    for chunk in chunk_rows {
        let stored = env.uploader.get(&ObjectName::partial(chunk.hash)).unwrap();
        reassembled.extend(codec::decompress(&stored, CompressionAlgorithm::Zlib).unwrap());
    }
    assert_eq!(reassembled, noisy_bytes(120 * 1024, 7));

    // Small files went in as bulk blobs referenced by content hash.
    let small_entry = root.lookup("/data/readme.txt").unwrap();
    let stored = env
        .uploader
        .get(&ObjectName::data(small_entry.content_hash.unwrap()))
        .unwrap();
    assert_eq!(
        codec::decompress(&stored, CompressionAlgorithm::Zlib).unwrap(),
        b"hello cascadefs"
    );

    // Tag the revision in the history log.
    let db_path = env.staging.path().join("history.db");
    let mut history = History::create(&db_path, "alpha.example.org").unwrap();
    history
        .insert(Tag {
            name: "v1".to_string(),
            root_hash: manifest.root_hash,
            size: manifest.root_size,
            revision: manifest.revision,
            timestamp: manifest.published_at as i64,
            channel: UpdateChannel::Trunk,
            description: "first publish".to_string(),
        })
        .unwrap();
    assert_eq!(history.tips().len(), 1);
    assert_eq!(history.tips()[0].root_hash, manifest.root_hash);
}

#[test]
fn single_chunk_promotion_observable_at_catalog_level() {
    // A 1 KiB file with chunking enabled: the processor promotes the lone
    // chunk to a bulk blob, so the catalog records a plain file.
    let env = PublishEnv::new("alpha.example.org");
    let input = env.write_input("tiny.bin", &noisy_bytes(1024, 3));
    let results = env.process_files(&[(input, true)]);

    let r = &results[0];
    assert!(r.chunks.is_empty());
    let bulk = r.bulk.unwrap();
    assert_eq!(bulk.size, 1024);

    record_result(&env, r, "");
    let manifest = env.manager.commit(None).unwrap();
    let sealed = env
        .uploader
        .get(&ObjectName::catalog(manifest.root_hash))
        .unwrap();
    let root = Catalog::from_sealed(&sealed, CompressionAlgorithm::Zlib).unwrap();
    let entry = root.lookup("/tiny.bin").unwrap();
    assert!(!entry.is_chunked);
    assert_eq!(entry.content_hash, Some(bulk.hash));
    assert!(root.chunks_of("/tiny.bin").is_none());
}

#[test]
fn nested_catalog_scenario_hundred_files() {
    // Create root, add 100 files under /a/b, split there, snapshot: the
    // parent carries exactly one mountpoint row whose hash equals the
    // child's content hash. Merging moves all rows back.
    let env = PublishEnv::new("alpha.example.org");
    env.manager.add_directory(dir("a"), "").unwrap();
    env.manager.add_directory(dir("b"), "/a").unwrap();
    for i in 0..100 {
        env.manager
            .add_file(
                DirectoryEntry::new_file(&format!("f{i}"), 16, 0o644, 0, 0, 1000),
                "/a/b",
            )
            .unwrap();
    }
    env.manager.create_nested_catalog("/a/b").unwrap();

    let manifest = env.manager.commit(None).unwrap();
    let child_hash = env.manager.nested_hash_of("/a/b").unwrap();

    let sealed_root = env
        .uploader
        .get(&ObjectName::catalog(manifest.root_hash))
        .unwrap();
    let root = Catalog::from_sealed(&sealed_root, CompressionAlgorithm::Zlib).unwrap();
    assert_eq!(root.nested_mountpoints(), vec!["/a/b".to_string()]);
    assert_eq!(root.nested_hash("/a/b"), Some(child_hash));
    assert!(root.lookup("/a/b").unwrap().is_nested_mountpoint);
    assert!(root.lookup("/a/b/f0").is_none(), "rows live in the child");

    let sealed_child = env
        .uploader
        .get(&ObjectName::catalog(child_hash))
        .unwrap();
    let child = Catalog::from_sealed(&sealed_child, CompressionAlgorithm::Zlib).unwrap();
    assert!(child.lookup("/a/b").unwrap().is_nested_root);
    assert_eq!(child.weight(), 101);

    env.manager.remove_nested_catalog("/a/b").unwrap();
    let manifest = env.manager.commit(None).unwrap();
    let sealed_root = env
        .uploader
        .get(&ObjectName::catalog(manifest.root_hash))
        .unwrap();
    let root = Catalog::from_sealed(&sealed_root, CompressionAlgorithm::Zlib).unwrap();
    assert!(root.nested_mountpoints().is_empty());
    for i in 0..100 {
        assert!(root.lookup(&format!("/a/b/f{i}")).is_some());
    }
}

#[test]
fn republish_after_rollback_reuses_history() {
    let env = PublishEnv::new("alpha.example.org");
    let db_path = env.staging.path().join("history.db");
    let mut history = History::create(&db_path, "alpha.example.org").unwrap();

    // Three published revisions on trunk.
    let mut manifests = Vec::new();
    for rev in 1..=3u64 {
        env.manager
            .add_directory(dir(&format!("rev{rev}")), "")
            .unwrap();
        let manifest = env.manager.commit(None).unwrap();
        history
            .insert(Tag {
                name: format!("v{rev}"),
                root_hash: manifest.root_hash,
                size: manifest.root_size,
                revision: manifest.revision,
                timestamp: 1_000_000 + rev as i64,
                channel: UpdateChannel::Trunk,
                description: String::new(),
            })
            .unwrap();
        manifests.push(manifest);
    }
    assert_eq!(history.count(), 3);

    // Roll trunk back to v1: v2 and v3 disappear, v1 reappears at a
    // fresh revision pointing at its original root.
    let mut rollback = history.get_by_name("v1").unwrap();
    rollback.revision = 4;
    history.rollback(rollback).unwrap();

    assert!(history.exists("v1"));
    assert!(!history.exists("v2"));
    assert!(!history.exists("v3"));
    let restored = history.get_by_name("v1").unwrap();
    assert_eq!(restored.revision, 4);
    assert_eq!(restored.root_hash, manifests[0].root_hash);

    // The rolled-back root catalog is still in the store.
    assert!(env
        .uploader
        .contains(&ObjectName::catalog(restored.root_hash)));
}

#[test]
fn dedup_across_files_shares_objects() {
    let env = PublishEnv::new("alpha.example.org");
    let payload = noisy_bytes(60 * 1024, 11);
    let a = env.write_input("copy-a.bin", &payload);
    let b = env.write_input("copy-b.bin", &payload);

    let results = env.process_files(&[(a, true), (b, true)]);
    assert!(results.iter().all(|r| r.is_success()));

    // Identical content, identical chunk names: the store holds one copy.
    let objects_for = |r: &FileResults| -> Vec<String> {
        r.chunks
            .iter()
            .map(|c| ObjectName::partial(c.hash).to_key())
            .chain(r.bulk.map(|b| ObjectName::data(b.hash).to_key()))
            .collect()
    };
    assert_eq!(objects_for(&results[0]), objects_for(&results[1]));
    let expected: std::collections::HashSet<String> =
        results.iter().flat_map(|r| objects_for(r)).collect();
    assert_eq!(env.uploader.len(), expected.len());
}
