// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::MessageExt;
use crate::gen::build::bazel::remote::execution::v2 as remexec;
use crate::verify_directory_canonical;

fn file(name: &str) -> remexec::FileNode {
    remexec::FileNode {
        name: name.to_owned(),
        digest: Some(fingerprint::Digest::of_bytes(name.as_bytes()).into()),
        is_executable: false,
    }
}

fn directory_digest(directory: &remexec::Directory) -> fingerprint::Digest {
    fingerprint::Digest::of_bytes(&directory.to_bytes())
}

#[test]
fn canonical_directory_is_accepted() {
    let directory = remexec::Directory {
        files: vec![file("a"), file("b")],
        directories: vec![],
        symlinks: vec![],
    };
    verify_directory_canonical(directory_digest(&directory), &directory).unwrap();
}

#[test]
fn unsorted_files_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file("b"), file("a")],
        directories: vec![],
        symlinks: vec![],
    };
    let err = verify_directory_canonical(directory_digest(&directory), &directory).unwrap_err();
    assert!(err.contains("unsorted"), "was: {err}");
}

#[test]
fn duplicate_names_across_kinds_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file("a")],
        directories: vec![remexec::DirectoryNode {
            name: "a".to_owned(),
            digest: Some(remexec::empty_digest()),
        }],
        symlinks: vec![],
    };
    let err = verify_directory_canonical(directory_digest(&directory), &directory).unwrap_err();
    assert!(err.contains("multiple entries"), "was: {err}");
}

#[test]
fn separator_in_name_is_rejected() {
    let directory = remexec::Directory {
        files: vec![file("a/b")],
        directories: vec![],
        symlinks: vec![],
    };
    let err = verify_directory_canonical(directory_digest(&directory), &directory).unwrap_err();
    assert!(err.contains("path separator"), "was: {err}");
}

#[test]
fn file_without_digest_is_rejected() {
    let directory = remexec::Directory {
        files: vec![remexec::FileNode {
            name: "a".to_owned(),
            digest: None,
            is_executable: false,
        }],
        directories: vec![],
        symlinks: vec![],
    };
    let err = verify_directory_canonical(directory_digest(&directory), &directory).unwrap_err();
    assert!(err.contains("no digest"), "was: {err}");
}
