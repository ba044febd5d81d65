// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use async_trait::async_trait;
use log::log_enabled;
use vfs::directory::{DigestTrie, Entry, TypedPath};
use vfs::{DirectoryDigest, GlobMatching, PreparedPathGlobs, RelativePath, SymlinkBehavior};

use crate::{Store, StoreError};

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum SnapshotOpsError {
    String(String),
    DigestMergeFailure(String),
    GlobMatchError(String),
}

impl From<String> for SnapshotOpsError {
    fn from(err: String) -> Self {
        Self::String(err)
    }
}

impl From<StoreError> for SnapshotOpsError {
    fn from(err: StoreError) -> Self {
        Self::String(err.to_string())
    }
}

impl std::fmt::Display for SnapshotOpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) | Self::DigestMergeFailure(s) | Self::GlobMatchError(s) => {
                write!(f, "{s}")
            }
        }
    }
}

///
/// Parameters for subsetting a snapshot to the paths matching some globs.
///
#[derive(Debug, Clone)]
pub struct SubsetParams {
    pub globs: PreparedPathGlobs,
}

///
/// High-level operations on DirectoryDigests, expressed over in-memory tries and persisted
/// to the backing store so that result digests remain loadable across processes.
///
#[async_trait]
pub trait SnapshotOps: Clone + Send + Sync + 'static {
    type Error: From<String> + From<StoreError> + Send + Sync + std::fmt::Debug + 'static;

    async fn load_digest_trie(&self, digest: DirectoryDigest) -> Result<DigestTrie, Self::Error>;
    async fn record_digest_trie(
        &self,
        tree: DigestTrie,
        initial_lease: bool,
    ) -> Result<DirectoryDigest, Self::Error>;

    ///
    /// Given N DirectoryDigests, merge them recursively into a single output digest.
    ///
    /// Identical entries are coalesced; colliding entries fail with the colliding path.
    ///
    async fn merge(&self, digests: Vec<DirectoryDigest>) -> Result<DirectoryDigest, Self::Error> {
        let mut tries = Vec::with_capacity(digests.len());
        for digest in digests {
            tries.push(self.load_digest_trie(digest).await?);
        }

        let merged = DigestTrie::merge(tries).map_err(|err| Self::Error::from(String::from(err)))?;
        self.record_digest_trie(merged, true).await
    }

    async fn add_prefix(
        &self,
        digest: DirectoryDigest,
        prefix: &RelativePath,
    ) -> Result<DirectoryDigest, Self::Error> {
        let tree = self.load_digest_trie(digest).await?.add_prefix(prefix)?;
        self.record_digest_trie(tree, true).await
    }

    async fn strip_prefix(
        &self,
        digest: DirectoryDigest,
        prefix: &RelativePath,
    ) -> Result<DirectoryDigest, Self::Error> {
        let tree = self.load_digest_trie(digest).await?.remove_prefix(prefix)?;
        self.record_digest_trie(tree, true).await
    }

    ///
    /// The subtree of the given digest whose paths match the given globs. Unmatched
    /// required globs fail per the globs' strict-matching behaviour.
    ///
    async fn subset(
        &self,
        digest: DirectoryDigest,
        params: SubsetParams,
    ) -> Result<DirectoryDigest, Self::Error> {
        let input_tree = self.load_digest_trie(digest).await?;
        let path_stats = input_tree
            .expand_globs(params.globs, SymlinkBehavior::Aware, None)
            .await
            .map_err(|err| Self::Error::from(format!("Error matching globs against subset: {err}")))?;

        let mut files = HashMap::new();
        for path_stat in &path_stats {
            if let vfs::PathStat::File { path, .. } = path_stat {
                match input_tree.entry(path)? {
                    Some(Entry::File(f)) => {
                        files.insert(path.clone(), f.digest());
                    }
                    entry => {
                        return Err(Self::Error::from(format!(
                            "Subset matched {path:?}, but it was not a file: {:?}",
                            entry.map(|e| e.name())
                        )));
                    }
                }
            }
        }

        let subset_tree = DigestTrie::from_unique_paths(
            path_stats.iter().map(TypedPath::from).collect(),
            &files,
        )?;
        self.record_digest_trie(subset_tree, true).await
    }

    ///
    /// Compares two snapshots by path and then by digest: files with the same path but
    /// different digests appear as changed.
    ///
    async fn snapshot_diff(
        &self,
        ours: DirectoryDigest,
        theirs: DirectoryDigest,
    ) -> Result<vfs::directory::DigestTrieDiff, Self::Error> {
        let our_tree = self.load_digest_trie(ours).await?;
        let their_tree = self.load_digest_trie(theirs).await?;
        if log_enabled!(log::Level::Trace) {
            log::trace!(
                "Diffing {:?} and {:?}",
                our_tree.compute_root_digest(),
                their_tree.compute_root_digest()
            );
        }
        Ok(our_tree.diff(&their_tree))
    }

    ///
    /// Creates a digest with the given file contents, for tests and intrinsics which build
    /// synthetic trees.
    ///
    async fn create_digest(
        &self,
        items: Vec<(RelativePath, bytes::Bytes, bool)>,
    ) -> Result<DirectoryDigest, Self::Error>;
}

#[async_trait]
impl SnapshotOps for Store {
    type Error = StoreError;

    async fn load_digest_trie(&self, digest: DirectoryDigest) -> Result<DigestTrie, StoreError> {
        Store::load_digest_trie(self, digest).await
    }

    async fn record_digest_trie(
        &self,
        tree: DigestTrie,
        initial_lease: bool,
    ) -> Result<DirectoryDigest, StoreError> {
        Store::record_digest_trie(self, tree, initial_lease)
            .await
            .map_err(StoreError::from)
    }

    async fn create_digest(
        &self,
        items: Vec<(RelativePath, bytes::Bytes, bool)>,
    ) -> Result<DirectoryDigest, StoreError> {
        let mut file_digests = HashMap::new();
        for (path, bytes, _) in &items {
            let digest = self.store_file_bytes(bytes.clone(), true).await?;
            file_digests.insert(path.to_path_buf(), digest);
        }

        let typed_paths = items
            .iter()
            .map(|(path, _, is_executable)| TypedPath::File {
                path: path.as_ref(),
                is_executable: *is_executable,
            })
            .collect::<Vec<_>>();
        let tree = DigestTrie::from_unique_paths(typed_paths, &file_digests)?;
        Store::record_digest_trie(self, tree, true)
            .await
            .map_err(StoreError::from)
    }
}
