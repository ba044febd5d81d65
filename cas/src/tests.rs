// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fingerprint::EMPTY_DIGEST;
use tempfile::TempDir;
use testutil::{TestData, TestDirectory};
use vfs::directory::{DigestTrie, TypedPath};
use vfs::{
    DirectoryDigest, GlobExpansionConjunction, PathGlobs, Permissions, RelativePath,
    StrictGlobMatching,
};

use crate::{EntryType, LocalOptions, SnapshotOps, Store, StoreError, SubsetParams};

pub(crate) fn new_store(dir: &TempDir) -> Store {
    Store::local_only_with_options(
        pool::Executor::new(),
        dir.path(),
        LocalOptions {
            files_max_size_bytes: 16 * 1024 * 1024,
            directories_max_size_bytes: 16 * 1024 * 1024,
            ..LocalOptions::default()
        },
    )
    .unwrap()
}

pub(crate) fn trie_of(files: &[(&str, &str)]) -> DigestTrie {
    let mut file_digests = HashMap::new();
    let mut paths = Vec::new();
    for (path, content) in files {
        file_digests.insert(
            PathBuf::from(path),
            fingerprint::Digest::of_bytes(content.as_bytes()),
        );
        paths.push(TypedPath::File {
            path: Path::new(path),
            is_executable: false,
        });
    }
    DigestTrie::from_unique_paths(paths, &file_digests).unwrap()
}

async fn store_trie(store: &Store, files: &[(&str, &str)]) -> DirectoryDigest {
    for (_, content) in files {
        store
            .store_file_bytes(Bytes::copy_from_slice(content.as_bytes()), false)
            .await
            .unwrap();
    }
    store
        .record_digest_trie(trie_of(files), false)
        .await
        .unwrap()
}

#[tokio::test]
async fn file_bytes_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let testdata = TestData::roland();

    let digest = store.store_file_bytes(testdata.bytes(), false).await.unwrap();
    assert_eq!(digest, testdata.digest());
    let loaded = store
        .load_file_bytes_with(digest, Bytes::copy_from_slice)
        .await
        .unwrap();
    assert_eq!(loaded, testdata.bytes());
}

#[tokio::test]
async fn missing_file_is_a_missing_digest_error() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let err = store
        .load_file_bytes_with(TestData::roland().digest(), |_| ())
        .await
        .unwrap_err();
    match err {
        StoreError::MissingDigest(_, digest) => assert_eq!(digest, TestData::roland().digest()),
        err => panic!("Expected MissingDigest, got: {err}"),
    }
}

#[tokio::test]
async fn digest_trie_roundtrips_through_persistence() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let dd = store_trie(&store, &[("a", "hi"), ("sub/b", "bye")]).await;

    // Discard the in-memory trie, forcing a load from the persisted Directories.
    let persisted = DirectoryDigest::from_persisted_digest(dd.as_digest());
    let tree = store.load_digest_trie(persisted).await.unwrap();
    assert_eq!(tree.compute_root_digest(), dd.as_digest());
}

#[tokio::test]
async fn load_directory_verifies_canonicality() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let testdir = TestDirectory::containing_roland();

    store
        .record_digest_trie(
            DigestTrie::from_remexec_directories(&testdir.directory(), &HashMap::new()).unwrap(),
            false,
        )
        .await
        .unwrap();
    let loaded = store.load_directory(testdir.digest()).await.unwrap().unwrap();
    assert_eq!(loaded, testdir.directory());
}

#[tokio::test]
async fn merge_digests_of_distinct_files() {
    // S1: merge_digests([digest_of({"a": "hi"}), digest_of({"b": "bye"})]) equals the digest
    // of {"a": "hi", "b": "bye"}.
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let a = store_trie(&store, &[("a", "hi")]).await;
    let b = store_trie(&store, &[("b", "bye")]).await;
    let expected = trie_of(&[("a", "hi"), ("b", "bye")]).compute_root_digest();

    let merged = store.merge(vec![a.clone(), b.clone()]).await.unwrap();
    assert_eq!(merged.as_digest(), expected);

    // Merge commutes for non-conflicting inputs.
    let merged_reverse = store.merge(vec![b, a]).await.unwrap();
    assert_eq!(merged_reverse.as_digest(), expected);
}

#[tokio::test]
async fn merge_digests_with_conflict_fails() {
    // S2: merging {"a": "hi"} with {"a": "ho"} fails, naming the conflicting path.
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let a1 = store_trie(&store, &[("a", "hi")]).await;
    let a2 = store_trie(&store, &[("a", "ho")]).await;

    let err = store.merge(vec![a1, a2]).await.unwrap_err();
    let message = format!("{err}");
    assert!(message.contains("\"a\"") || message.contains("at \"a\""), "was: {message}");
}

#[tokio::test]
async fn add_then_strip_prefix_is_identity() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let dd = store_trie(&store, &[("a", "hi"), ("sub/b", "bye")]).await;
    let prefix = RelativePath::new("prefix/dir").unwrap();

    let prefixed = store.add_prefix(dd.clone(), &prefix).await.unwrap();
    assert_ne!(prefixed.as_digest(), dd.as_digest());
    let stripped = store.strip_prefix(prefixed, &prefix).await.unwrap();
    assert_eq!(stripped.as_digest(), dd.as_digest());
}

#[tokio::test]
async fn subset_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let dd = store_trie(&store, &[("a.txt", "hi"), ("b.rs", "bye"), ("sub/c.txt", "c")]).await;

    let subset_params = || SubsetParams {
        globs: PathGlobs::new(
            vec!["**/*.txt".to_owned()],
            StrictGlobMatching::Ignore,
            GlobExpansionConjunction::AllMatch,
        )
        .parse()
        .unwrap(),
    };

    let once = store.subset(dd, subset_params()).await.unwrap();
    assert_eq!(
        once.as_digest(),
        trie_of(&[("a.txt", "hi"), ("sub/c.txt", "c")]).compute_root_digest(),
    );
    let twice = store.subset(once.clone(), subset_params()).await.unwrap();
    assert_eq!(once.as_digest(), twice.as_digest());
}

#[tokio::test]
async fn snapshot_diff_reports_changes() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let ours = store_trie(&store, &[("same", "x"), ("changed", "ours")]).await;
    let theirs = store_trie(&store, &[("same", "x"), ("changed", "theirs")]).await;

    let diff = store.snapshot_diff(ours, theirs).await.unwrap();
    assert_eq!(diff.changed_files, vec![PathBuf::from("changed")]);
    assert!(diff.our_unique_files.is_empty());
}

#[tokio::test]
async fn materialize_writes_the_tree() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let dd = store_trie(&store, &[("a", "hi"), ("sub/b", "bye")]).await;

    let dest_root = TempDir::new().unwrap();
    let destination = dest_root.path().join("out");
    store
        .materialize_directory(
            destination.clone(),
            dest_root.path(),
            dd.clone(),
            &[],
            Permissions::Writable,
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(destination.join("a")).unwrap(), b"hi");
    assert_eq!(std::fs::read(destination.join("sub/b")).unwrap(), b"bye");

    // Idempotent for identical inputs.
    store
        .materialize_directory(
            destination.clone(),
            dest_root.path(),
            dd,
            &[],
            Permissions::Writable,
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(destination.join("a")).unwrap(), b"hi");
}

#[tokio::test]
async fn materialize_clears_requested_paths_first() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let dd = store_trie(&store, &[("kept", "new")]).await;

    let dest_root = TempDir::new().unwrap();
    let destination = dest_root.path().join("out");
    std::fs::create_dir_all(destination.join("stale-dir")).unwrap();
    std::fs::write(destination.join("stale-dir/file"), b"old").unwrap();

    store
        .materialize_directory(
            destination.clone(),
            dest_root.path(),
            dd,
            &[RelativePath::new("stale-dir").unwrap()],
            Permissions::Writable,
        )
        .await
        .unwrap();

    assert!(!destination.join("stale-dir").exists());
    assert_eq!(std::fs::read(destination.join("kept")).unwrap(), b"new");
}

#[tokio::test]
async fn materialize_preserves_executable_bits() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let digest = store
        .store_file_bytes(Bytes::from_static(b"#!/bin/sh\n"), false)
        .await
        .unwrap();
    let mut file_digests = HashMap::new();
    file_digests.insert(PathBuf::from("run.sh"), digest);
    let tree = DigestTrie::from_unique_paths(
        vec![TypedPath::File {
            path: Path::new("run.sh"),
            is_executable: true,
        }],
        &file_digests,
    )
    .unwrap();
    let dd = store.record_digest_trie(tree, false).await.unwrap();

    let dest_root = TempDir::new().unwrap();
    let destination = dest_root.path().join("out");
    store
        .materialize_directory(
            destination.clone(),
            dest_root.path(),
            dd,
            &[],
            Permissions::Writable,
        )
        .await
        .unwrap();

    let mode = std::fs::metadata(destination.join("run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o111, 0o111);
}

#[tokio::test]
async fn garbage_collect_respects_leases() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    // One leased entry, one unleased.
    let leased = store
        .store_file_bytes(TestData::roland().bytes(), true)
        .await
        .unwrap();
    let unleased = store
        .store_file_bytes(TestData::catnip().bytes(), false)
        .await
        .unwrap();

    let achieved = store.garbage_collect(0).await.unwrap();
    // The leased entry survives even though the target was zero.
    assert!(achieved >= leased.size_bytes);
    assert!(
        store
            .load_file_bytes_with(leased, |_| ())
            .await
            .is_ok()
    );
    assert!(matches!(
        store.load_file_bytes_with(unleased, |_| ()).await,
        Err(StoreError::MissingDigest(..))
    ));
}

#[tokio::test]
async fn empty_digest_needs_no_storage() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let loaded = store
        .load_file_bytes_with(EMPTY_DIGEST, Bytes::copy_from_slice)
        .await
        .unwrap();
    assert_eq!(loaded, Bytes::new());

    let missing = store
        .all_local_digests(EntryType::File)
        .await
        .unwrap();
    assert!(missing.is_empty());
}
