// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    Dir, GitignoreStyleExcludes, GlobExpansionConjunction, GlobMatching, PathGlobs, PathStat,
    PosixFS, Stat, StrictGlobMatching, SymlinkBehavior,
};

fn make_file(path: &Path, contents: &[u8], mode: u32) {
    fs::write(path, contents).unwrap();
    let mut permissions = fs::metadata(path).unwrap().permissions();
    permissions.set_mode(mode);
    fs::set_permissions(path, permissions).unwrap();
}

fn new_posixfs(root: &Path) -> Arc<PosixFS> {
    Arc::new(
        PosixFS::new(root, GitignoreStyleExcludes::empty(), pool::Executor::new()).unwrap(),
    )
}

#[tokio::test]
async fn scandir_sorts_and_stats() {
    let root = tempfile::TempDir::new().unwrap();
    fs::create_dir(root.path().join("dir")).unwrap();
    make_file(&root.path().join("b.txt"), b"b", 0o600);
    make_file(&root.path().join("a.sh"), b"#!/bin/sh", 0o755);
    symlink("b.txt", root.path().join("link")).unwrap();

    let posix_fs = new_posixfs(root.path());
    let listing = posix_fs.scandir(Dir(PathBuf::new())).await.unwrap();
    assert_eq!(
        listing.0,
        vec![
            Stat::file(PathBuf::from("a.sh"), true),
            Stat::file(PathBuf::from("b.txt"), false),
            Stat::dir(PathBuf::from("dir")),
            Stat::link(PathBuf::from("link"), PathBuf::from("b.txt")),
        ],
    );
}

#[tokio::test]
async fn scandir_applies_ignore_patterns() {
    let root = tempfile::TempDir::new().unwrap();
    make_file(&root.path().join("kept.txt"), b"k", 0o600);
    make_file(&root.path().join("ignored.tmp"), b"i", 0o600);

    let ignorer = GitignoreStyleExcludes::create(vec!["*.tmp".to_owned()]).unwrap();
    let posix_fs = Arc::new(PosixFS::new(root.path(), ignorer, pool::Executor::new()).unwrap());
    let listing = posix_fs.scandir(Dir(PathBuf::new())).await.unwrap();
    assert_eq!(listing.0, vec![Stat::file(PathBuf::from("kept.txt"), false)]);
}

#[tokio::test]
async fn stat_sync_missing_path_is_none() {
    let root = tempfile::TempDir::new().unwrap();
    let posix_fs = new_posixfs(root.path());
    assert!(
        posix_fs
            .stat_sync(Path::new("no-such-file"))
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn read_link_rejects_absolute_targets() {
    let root = tempfile::TempDir::new().unwrap();
    symlink("/etc/passwd", root.path().join("link")).unwrap();
    let posix_fs = new_posixfs(root.path());
    let link = crate::Link {
        path: PathBuf::from("link"),
        target: PathBuf::from("/etc/passwd"),
    };
    assert!(posix_fs.read_link(&link).await.is_err());
}

#[tokio::test]
async fn expand_globs_over_workspace() {
    let root = tempfile::TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("src/sub")).unwrap();
    make_file(&root.path().join("src/foo.txt"), b"foo", 0o600);
    make_file(&root.path().join("src/sub/bar.txt"), b"bar", 0o600);
    make_file(&root.path().join("top.rs"), b"top", 0o600);

    let posix_fs = new_posixfs(root.path());
    let path_globs = PathGlobs::new(
        vec!["src/**".to_owned()],
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()
    .unwrap();
    let path_stats = posix_fs
        .expand_globs(path_globs, SymlinkBehavior::Aware, None)
        .await
        .unwrap();
    let files: Vec<_> = path_stats
        .into_iter()
        .filter_map(|ps| match ps {
            PathStat::File { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(
        files,
        vec![PathBuf::from("src/foo.txt"), PathBuf::from("src/sub/bar.txt")],
    );
}

#[tokio::test]
async fn expand_globs_follows_symlinks_obliviously() {
    let root = tempfile::TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("real")).unwrap();
    make_file(&root.path().join("real/file.txt"), b"content", 0o600);
    symlink("real", root.path().join("aliased")).unwrap();

    let posix_fs = new_posixfs(root.path());
    let path_globs = PathGlobs::new(
        vec!["aliased/*.txt".to_owned()],
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()
    .unwrap();
    let path_stats = posix_fs
        .expand_globs(path_globs, SymlinkBehavior::Oblivious, None)
        .await
        .unwrap();
    assert_eq!(path_stats.len(), 1);
    assert_eq!(path_stats[0].path(), Path::new("aliased/file.txt"));
}
