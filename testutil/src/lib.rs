// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Canonical test fixtures shared by the store, executor, and engine tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bytes::Bytes;
use fingerprint::Digest;
use reapi::MessageExt;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;

/// A blob of bytes with convenient accessors for its digest.
#[derive(Clone)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn empty() -> TestData {
        TestData::new("")
    }

    pub fn roland() -> TestData {
        TestData::new("European Burmese")
    }

    pub fn catnip() -> TestData {
        TestData::new("catnip")
    }

    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.string.as_bytes())
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(self.string.as_bytes())
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }
}

/// A canonical Directory proto with convenient accessors for its digest.
#[derive(Clone)]
pub struct TestDirectory {
    pub directory: remexec::Directory,
}

impl TestDirectory {
    pub fn empty() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory::default(),
        }
    }

    /// A directory containing one file named "roland".
    pub fn containing_roland() -> TestDirectory {
        let directory = remexec::Directory {
            files: vec![remexec::FileNode {
                name: "roland".to_owned(),
                digest: Some((&TestData::roland().digest()).into()),
                is_executable: false,
            }],
            ..remexec::Directory::default()
        };
        TestDirectory { directory }
    }

    /// A directory containing a subdirectory "cats" which contains "roland".
    pub fn nested() -> TestDirectory {
        let directory = remexec::Directory {
            directories: vec![remexec::DirectoryNode {
                name: "cats".to_owned(),
                digest: Some((&TestDirectory::containing_roland().digest()).into()),
            }],
            ..remexec::Directory::default()
        };
        TestDirectory { directory }
    }

    pub fn directory(&self) -> remexec::Directory {
        self.directory.clone()
    }

    pub fn bytes(&self) -> Bytes {
        self.directory.to_bytes()
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.bytes())
    }
}

/// Writes a file with the given mode, creating parent directories as needed.
pub fn make_file(path: &Path, contents: &[u8], mode: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
    let mut permissions = fs::metadata(path).unwrap().permissions();
    permissions.set_mode(mode);
    fs::set_permissions(path, permissions).unwrap();
}
