// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::directory::{DigestTrie, TypedPath};
use crate::glob_matching::{FilespecMatcher, GlobMatching};
use crate::{
    GlobExpansionConjunction, PathGlobs, PathStat, StrictGlobMatching, SymlinkBehavior,
};

fn trie(paths: &[&str]) -> DigestTrie {
    let mut file_digests = HashMap::new();
    let mut typed_paths = Vec::new();
    for path in paths {
        file_digests.insert(
            PathBuf::from(path),
            fingerprint::Digest::of_bytes(path.as_bytes()),
        );
        typed_paths.push(TypedPath::File {
            path: Path::new(path),
            is_executable: false,
        });
    }
    DigestTrie::from_unique_paths(typed_paths, &file_digests).unwrap()
}

async fn expand(trie: &DigestTrie, globs: &[&str]) -> Result<Vec<PathBuf>, String> {
    let path_globs = PathGlobs::new(
        globs.iter().map(|s| s.to_string()).collect(),
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()?;
    let path_stats = trie
        .expand_globs(path_globs, SymlinkBehavior::Oblivious, None)
        .await?;
    Ok(path_stats
        .into_iter()
        .filter_map(|ps| match ps {
            PathStat::File { path, .. } => Some(path),
            _ => None,
        })
        .collect())
}

#[tokio::test]
async fn single_star_matches_one_segment() {
    let trie = trie(&["a.txt", "b.rs", "sub/c.txt"]);
    assert_eq!(
        expand(&trie, &["*.txt"]).await.unwrap(),
        vec![PathBuf::from("a.txt")]
    );
}

#[tokio::test]
async fn double_star_matches_zero_or_more_segments() {
    let trie = trie(&["a.txt", "sub/c.txt", "sub/deeper/d.txt", "sub/e.rs"]);
    assert_eq!(
        expand(&trie, &["**/*.txt"]).await.unwrap(),
        vec![
            PathBuf::from("a.txt"),
            PathBuf::from("sub/c.txt"),
            PathBuf::from("sub/deeper/d.txt"),
        ],
    );
}

#[tokio::test]
async fn trailing_double_star_matches_everything_inside() {
    let trie = trie(&["sub/c.txt", "sub/deeper/d.txt", "other/e.txt"]);
    assert_eq!(
        expand(&trie, &["sub/**"]).await.unwrap(),
        vec![PathBuf::from("sub/c.txt"), PathBuf::from("sub/deeper/d.txt")],
    );
}

#[tokio::test]
async fn question_mark_and_character_classes() {
    let trie = trie(&["a1", "a2", "b1", "ab1"]);
    assert_eq!(
        expand(&trie, &["a?"]).await.unwrap(),
        vec![PathBuf::from("a1"), PathBuf::from("a2")],
    );
    assert_eq!(
        expand(&trie, &["[ab]1"]).await.unwrap(),
        vec![PathBuf::from("a1"), PathBuf::from("b1")],
    );
}

#[tokio::test]
async fn exclude_globs_apply() {
    let trie = trie(&["a.txt", "b.txt", "sub/c.txt"]);
    assert_eq!(
        expand(&trie, &["**/*.txt", "!b.txt"]).await.unwrap(),
        vec![PathBuf::from("a.txt"), PathBuf::from("sub/c.txt")],
    );
}

#[tokio::test]
async fn results_are_sorted_and_deduped() {
    let trie = trie(&["a.txt", "z.txt"]);
    // Overlapping globs match the same paths; output is sorted and unique.
    assert_eq!(
        expand(&trie, &["*.txt", "a.*", "z.txt"]).await.unwrap(),
        vec![PathBuf::from("a.txt"), PathBuf::from("z.txt")],
    );
}

#[tokio::test]
async fn absolute_globs_are_rejected() {
    let trie = trie(&["a.txt"]);
    let err = expand(&trie, &["/etc/passwd"]).await.unwrap_err();
    assert!(err.contains("Absolute paths not supported"), "was: {err}");
}

#[tokio::test]
async fn parent_dir_globs_may_not_escape_the_root() {
    let trie = trie(&["a.txt"]);
    let err = expand(&trie, &["../sibling/*.txt"]).await.unwrap_err();
    assert!(err.contains("outside of the buildroot"), "was: {err}");
}

#[tokio::test]
async fn unmatched_globs_error_under_strict_matching() {
    let trie = trie(&["a.txt"]);
    let path_globs = PathGlobs::new(
        vec!["missing/**".to_owned()],
        StrictGlobMatching::Error("a test".to_owned()),
        GlobExpansionConjunction::AllMatch,
    )
    .parse()
    .unwrap();
    let err = trie
        .expand_globs(path_globs, SymlinkBehavior::Oblivious, None)
        .await
        .unwrap_err();
    assert!(err.contains("Unmatched glob from a test"), "was: {err}");
}

#[tokio::test]
async fn any_match_conjunction_is_satisfied_by_one_match() {
    let trie = trie(&["a.txt"]);
    let path_globs = PathGlobs::new(
        vec!["missing/**".to_owned(), "*.txt".to_owned()],
        StrictGlobMatching::Error("a test".to_owned()),
        GlobExpansionConjunction::AnyMatch,
    )
    .parse()
    .unwrap();
    let path_stats = trie
        .expand_globs(path_globs, SymlinkBehavior::Oblivious, None)
        .await
        .unwrap();
    assert_eq!(path_stats.len(), 1);
}

#[test]
fn filespec_matcher_agrees_with_expansion_semantics() {
    let matcher = FilespecMatcher::new(
        vec!["**/*.txt".to_owned()],
        vec!["b.txt".to_owned()],
    )
    .unwrap();
    assert!(matcher.matches(Path::new("a.txt")));
    assert!(matcher.matches(Path::new("sub/c.txt")));
    assert!(!matcher.matches(Path::new("b.txt")));
    assert!(!matcher.matches(Path::new("a.rs")));
}
