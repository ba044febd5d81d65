// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use vfs::RelativePath;

///
/// The validated name of an append-only cache exposed to processes.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CacheName(String);

impl CacheName {
    pub fn new(name: String) -> Result<CacheName, String> {
        if name
            .chars()
            .all(|c| (c.is_ascii_alphanumeric() && c.is_ascii_lowercase()) || c == '_')
        {
            Ok(CacheName(name))
        } else {
            Err(format!(
                "Cache names may only contain lowercase alphanumeric characters or underscores: \
         got {name:?}"
            ))
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A symlink from a sandbox-relative source to an absolute destination.
#[derive(Debug)]
pub struct WorkdirSymlink {
    pub src: PathBuf,
    pub dst: PathBuf,
}

///
/// Append-only caches shared by all processes which request them, living under a base path
/// outside of any sandbox (`<cache_root>/named_caches/<name>`).
///
#[derive(Clone, Debug)]
pub struct NamedCaches {
    base_path: PathBuf,
}

impl NamedCaches {
    pub fn new(base_path: PathBuf) -> NamedCaches {
        NamedCaches { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    ///
    /// The symlinks to create in a sandbox for the given cache requests, creating the cache
    /// directories as a side effect.
    ///
    pub async fn paths(
        &self,
        caches: &BTreeMap<CacheName, RelativePath>,
    ) -> Result<Vec<WorkdirSymlink>, String> {
        let symlinks = caches
            .iter()
            .map(|(cache_name, workdir_rel_path)| WorkdirSymlink {
                src: workdir_rel_path.to_path_buf(),
                dst: self.base_path.join(&cache_name.0),
            })
            .collect::<Vec<_>>();

        for symlink in &symlinks {
            tokio::fs::create_dir_all(&symlink.dst).await.map_err(|err| {
                format!("Failed to create a directory for named cache {:?}: {err}", symlink.dst)
            })?;
        }

        Ok(symlinks)
    }
}
