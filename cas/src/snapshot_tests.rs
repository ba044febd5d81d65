// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use testutil::make_file;
use vfs::{
    GitignoreStyleExcludes, GlobExpansionConjunction, GlobMatching, PathGlobs, PosixFS,
    StrictGlobMatching, SymlinkBehavior,
};

use crate::tests::{new_store, trie_of};
use crate::{OneOffStoreFileByDigest, Snapshot};

async fn snapshot_of(root: &TempDir, store: &crate::Store, globs: &[&str]) -> Snapshot {
    let posix_fs = Arc::new(
        PosixFS::new(
            root.path(),
            GitignoreStyleExcludes::empty(),
            pool::Executor::new(),
        )
        .unwrap(),
    );
    let path_globs = PathGlobs::new(
        globs.iter().map(|s| s.to_string()).collect(),
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()
    .unwrap();
    let path_stats = posix_fs
        .expand_globs(path_globs, SymlinkBehavior::Aware, None)
        .await
        .unwrap();
    Snapshot::from_path_stats(
        OneOffStoreFileByDigest::new(store.clone(), posix_fs, true),
        path_stats,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn snapshot_digest_matches_equivalent_trie() {
    let root = TempDir::new().unwrap();
    make_file(&root.path().join("a"), b"hi", 0o600);
    make_file(&root.path().join("sub/b"), b"bye", 0o600);

    let store_dir = TempDir::new().unwrap();
    let store = new_store(&store_dir);
    let snapshot = snapshot_of(&root, &store, &["**"]).await;

    assert_eq!(
        snapshot.digest,
        trie_of(&[("a", "hi"), ("sub/b", "bye")]).compute_root_digest(),
    );
    assert_eq!(
        snapshot.files,
        vec![PathBuf::from("a"), PathBuf::from("sub/b")]
    );
    assert_eq!(snapshot.dirs, vec![PathBuf::from("sub")]);
}

#[tokio::test]
async fn snapshot_determinism_across_captures() {
    let root = TempDir::new().unwrap();
    make_file(&root.path().join("x"), b"same", 0o600);
    make_file(&root.path().join("y"), b"same", 0o600);

    let store_dir = TempDir::new().unwrap();
    let store = new_store(&store_dir);
    let first = snapshot_of(&root, &store, &["**"]).await;
    let second = snapshot_of(&root, &store, &["**"]).await;
    assert_eq!(first.digest, second.digest);
}

#[tokio::test]
async fn snapshot_from_digest_restores_path_lists() {
    let root = TempDir::new().unwrap();
    make_file(&root.path().join("a"), b"hi", 0o600);

    let store_dir = TempDir::new().unwrap();
    let store = new_store(&store_dir);
    let original = snapshot_of(&root, &store, &["**"]).await;

    let dd: vfs::DirectoryDigest = original.clone().into();
    store
        .record_digest_trie(dd.tree.clone().unwrap(), false)
        .await
        .unwrap();
    let restored = Snapshot::from_digest(
        store,
        vfs::DirectoryDigest::from_persisted_digest(dd.as_digest()),
    )
    .await
    .unwrap();
    assert_eq!(restored.digest, original.digest);
    assert_eq!(restored.files, original.files);
}

#[tokio::test]
async fn empty_snapshot_has_empty_digest() {
    assert_eq!(Snapshot::empty().digest, fingerprint::EMPTY_DIGEST);
}
