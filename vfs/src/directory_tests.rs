// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fingerprint::{Digest, EMPTY_DIGEST};

use crate::directory::{DigestTrie, Entry, MergeError, TypedPath};
use crate::{RelativePath, SymlinkBehavior};

fn make_trie(files: &[(&str, &str)]) -> DigestTrie {
    make_trie_with_symlinks(files, &[])
}

fn make_trie_with_symlinks(files: &[(&str, &str)], symlinks: &[(&str, &str)]) -> DigestTrie {
    let mut file_digests = HashMap::new();
    let mut paths = Vec::new();
    for (path, content) in files {
        file_digests.insert(PathBuf::from(path), Digest::of_bytes(content.as_bytes()));
        paths.push(TypedPath::File {
            path: Path::new(path),
            is_executable: false,
        });
    }
    for (path, target) in symlinks {
        paths.push(TypedPath::Link {
            path: Path::new(path),
            target: Path::new(target),
        });
    }
    DigestTrie::from_unique_paths(paths, &file_digests).unwrap()
}

#[test]
fn empty_trie_has_empty_digest() {
    assert_eq!(make_trie(&[]).compute_root_digest(), EMPTY_DIGEST);
}

#[test]
fn root_digest_is_independent_of_input_order() {
    let ab = make_trie(&[("a", "hi"), ("b", "bye")]);
    let ba = make_trie(&[("b", "bye"), ("a", "hi")]);
    assert_eq!(ab.compute_root_digest(), ba.compute_root_digest());
}

#[test]
fn duplicate_paths_are_rejected() {
    let mut file_digests = HashMap::new();
    file_digests.insert(PathBuf::from("a"), Digest::of_bytes(b"hi"));
    let paths = vec![
        TypedPath::File {
            path: Path::new("a"),
            is_executable: false,
        },
        TypedPath::File {
            path: Path::new("a"),
            is_executable: true,
        },
    ];
    assert!(DigestTrie::from_unique_paths(paths, &file_digests).is_err());
}

#[test]
fn files_and_directories_listings() {
    let trie = make_trie(&[("a", "hi"), ("sub/b", "bye"), ("sub/deeper/c", "c")]);
    assert_eq!(
        trie.files(SymlinkBehavior::Aware),
        vec![
            PathBuf::from("a"),
            PathBuf::from("sub/b"),
            PathBuf::from("sub/deeper/c")
        ],
    );
    assert_eq!(
        trie.directories(SymlinkBehavior::Aware),
        vec![PathBuf::from("sub"), PathBuf::from("sub/deeper")],
    );
}

#[test]
fn merge_distinct_paths() {
    // merge_digests([digest_of({"a": "hi"}), digest_of({"b": "bye"})]) is the digest of
    // {"a": "hi", "b": "bye"}.
    let merged = DigestTrie::merge(vec![make_trie(&[("a", "hi")]), make_trie(&[("b", "bye")])])
        .unwrap();
    assert_eq!(
        merged.compute_root_digest(),
        make_trie(&[("a", "hi"), ("b", "bye")]).compute_root_digest(),
    );
}

#[test]
fn merge_is_commutative_for_non_conflicting_inputs() {
    let a = make_trie(&[("a", "hi"), ("sub/x", "x")]);
    let b = make_trie(&[("b", "bye"), ("sub/y", "y")]);
    let ab = DigestTrie::merge(vec![a.clone(), b.clone()]).unwrap();
    let ba = DigestTrie::merge(vec![b, a]).unwrap();
    assert_eq!(ab.compute_root_digest(), ba.compute_root_digest());
}

#[test]
fn merge_identical_files_coalesce() {
    let merged =
        DigestTrie::merge(vec![make_trie(&[("a", "hi")]), make_trie(&[("a", "hi")])]).unwrap();
    assert_eq!(
        merged.compute_root_digest(),
        make_trie(&[("a", "hi")]).compute_root_digest(),
    );
}

#[test]
fn merge_conflicting_file_contents_fail() {
    let err = DigestTrie::merge(vec![make_trie(&[("a", "hi")]), make_trie(&[("a", "ho")])])
        .unwrap_err();
    match err {
        MergeError::Collision { path, entries } => {
            assert_eq!(path, PathBuf::from("a"));
            assert_eq!(entries.len(), 2);
        }
    }
}

#[test]
fn merge_file_directory_collision_fails() {
    let err = DigestTrie::merge(vec![make_trie(&[("a", "hi")]), make_trie(&[("a/b", "ho")])])
        .unwrap_err();
    match err {
        MergeError::Collision { path, .. } => assert_eq!(path, PathBuf::from("a")),
    }
}

#[test]
fn merge_conflict_in_subdirectory_reports_full_path() {
    let err = DigestTrie::merge(vec![
        make_trie(&[("sub/a", "hi")]),
        make_trie(&[("sub/a", "ho")]),
    ])
    .unwrap_err();
    match err {
        MergeError::Collision { path, .. } => assert_eq!(path, PathBuf::from("sub/a")),
    }
}

#[test]
fn add_prefix_then_remove_prefix_is_identity() {
    let trie = make_trie(&[("a", "hi"), ("sub/b", "bye")]);
    let original = trie.compute_root_digest();
    let prefix = RelativePath::new("outer/inner").unwrap();
    let round_tripped = trie
        .add_prefix(&prefix)
        .unwrap()
        .remove_prefix(&prefix)
        .unwrap();
    assert_eq!(round_tripped.compute_root_digest(), original);
}

#[test]
fn remove_prefix_fails_for_entries_outside_the_prefix() {
    let trie = make_trie(&[("outer/a", "hi"), ("stray", "bye")]);
    let err = trie
        .remove_prefix(&RelativePath::new("outer").unwrap())
        .unwrap_err();
    assert!(err.contains("contained non-matching"), "was: {err}");
}

#[test]
fn remove_prefix_of_missing_directory_fails_when_occupied() {
    let trie = make_trie(&[("stray", "bye")]);
    let err = trie
        .remove_prefix(&RelativePath::new("outer").unwrap())
        .unwrap_err();
    assert!(err.contains("didn't contain a directory"), "was: {err}");
}

#[test]
fn entry_returns_files_and_follows_symlinks() {
    let trie = make_trie_with_symlinks(&[("sub/b", "bye")], &[("link", "sub/b")]);

    match trie.entry(Path::new("sub/b")).unwrap().unwrap() {
        Entry::File(f) => assert_eq!(f.digest(), Digest::of_bytes(b"bye")),
        entry => panic!("Unexpected entry: {entry:?}"),
    }

    match trie.entry(Path::new("link")).unwrap().unwrap() {
        Entry::File(f) => assert_eq!(f.digest(), Digest::of_bytes(b"bye")),
        entry => panic!("Unexpected entry: {entry:?}"),
    }

    assert!(trie.entry(Path::new("missing")).unwrap().is_none());
}

#[test]
fn entry_rejects_traversal_below_files() {
    let trie = make_trie(&[("a", "hi")]);
    assert!(trie.entry(Path::new("a/nested")).is_err());
}

#[test]
fn symlink_cycles_are_bounded() {
    // A two-link cycle: each entry lookup increments the link depth until the bound trips.
    let trie = make_trie_with_symlinks(&[], &[("one", "two"), ("two", "one")]);
    assert!(trie.entry(Path::new("one")).unwrap().is_none());
}

#[test]
fn diff_partitions_paths() {
    let ours = make_trie(&[("same", "same"), ("changed", "ours"), ("only-ours", "x")]);
    let theirs = make_trie(&[("same", "same"), ("changed", "theirs"), ("only-theirs", "y")]);

    let diff = ours.diff(&theirs);
    assert_eq!(diff.changed_files, vec![PathBuf::from("changed")]);
    assert_eq!(diff.our_unique_files, vec![PathBuf::from("only-ours")]);
    assert_eq!(diff.their_unique_files, vec![PathBuf::from("only-theirs")]);
    assert!(diff.our_unique_dirs.is_empty());
}

#[test]
fn diff_recurses_into_changed_directories() {
    let ours = make_trie(&[("sub/same", "same"), ("sub/changed", "ours")]);
    let theirs = make_trie(&[("sub/same", "same"), ("sub/changed", "theirs")]);

    let diff = ours.diff(&theirs);
    assert_eq!(diff.changed_files, vec![PathBuf::from("sub/changed")]);
}

#[test]
fn remexec_tree_round_trip() {
    let trie = make_trie(&[("a", "hi"), ("sub/b", "bye")]);
    let tree: reapi::gen::build::bazel::remote::execution::v2::Tree = (&trie).into();
    let round_tripped = DigestTrie::try_from(tree).unwrap();
    assert_eq!(
        round_tripped.compute_root_digest(),
        trie.compute_root_digest()
    );
}
