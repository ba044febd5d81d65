// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use fingerprint::{Digest, EMPTY_DIGEST};
use futures::future::{self, BoxFuture, FutureExt};
use vfs::directory::{DigestTrie, TypedPath};
use vfs::{DirectoryDigest, File, PathStat, PosixFS, SymlinkBehavior};

use crate::{Store, StoreError};

///
/// A digest for a directory, plus the symlink-oblivious flattening of its file and
/// directory paths, cached so that consumers need not re-walk the tree.
///
#[derive(Clone)]
pub struct Snapshot {
    pub digest: Digest,
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
    tree: DigestTrie,
}

// Identity is the digest: the path lists are derived from the tree it names.
impl Eq for Snapshot {}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl std::hash::Hash for Snapshot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            digest: EMPTY_DIGEST,
            dirs: vec![],
            files: vec![],
            tree: vfs::EMPTY_DIGEST_TREE.clone(),
        }
    }

    ///
    /// Digests the given files (via the given `StoreFileByDigest`) and builds a Snapshot
    /// from the result.
    ///
    pub async fn from_path_stats<S: StoreFileByDigest<Error> + Sized, Error: fmt::Display>(
        file_digester: S,
        path_stats: Vec<PathStat>,
    ) -> Result<Snapshot, String> {
        let (paths, files): (Vec<_>, Vec<_>) = path_stats
            .iter()
            .filter_map(|ps| match ps {
                PathStat::File { path, stat } => Some((path.clone(), stat.clone())),
                _ => None,
            })
            .unzip();
        let file_digests = future::try_join_all(
            files
                .into_iter()
                .map(|file| file_digester.store_by_digest(file))
                .collect::<Vec<_>>(),
        )
        .await
        .map_err(|e| format!("Failed to digest inputs: {e}"))?;

        let file_digests_map = paths
            .into_iter()
            .zip(file_digests)
            .collect::<HashMap<_, _>>();

        let tree = DigestTrie::from_unique_paths(
            path_stats.iter().map(|p| p.into()).collect(),
            &file_digests_map,
        )?;
        Ok(Self::from_digest_trie(tree))
    }

    ///
    /// Loads the tree for the given DirectoryDigest (locally or remotely) and flattens it.
    ///
    pub async fn from_digest(store: Store, digest: DirectoryDigest) -> Result<Snapshot, StoreError> {
        Ok(Self::from_digest_trie(store.load_digest_trie(digest).await?))
    }

    fn from_digest_trie(tree: DigestTrie) -> Snapshot {
        Snapshot {
            digest: tree.compute_root_digest(),
            dirs: tree.directories(SymlinkBehavior::Oblivious),
            files: tree.files(SymlinkBehavior::Oblivious),
            tree,
        }
    }

    ///
    /// Capture a Snapshot of a single file at its position in the workspace.
    ///
    pub async fn of_one_file(
        store: Store,
        path: PathBuf,
        digest: Digest,
        is_executable: bool,
    ) -> Result<Snapshot, String> {
        let mut file_digests = HashMap::new();
        file_digests.insert(path.clone(), digest);
        let tree = DigestTrie::from_unique_paths(
            vec![TypedPath::File {
                path: &path,
                is_executable,
            }],
            &file_digests,
        )?;
        // Persist so that the Snapshot's digest is valid beyond this process.
        store.record_digest_trie(tree.clone(), true).await?;
        Ok(Self::from_digest_trie(tree))
    }

    pub fn tree(&self) -> &DigestTrie {
        &self.tree
    }
}

impl From<Snapshot> for DirectoryDigest {
    fn from(snapshot: Snapshot) -> Self {
        DirectoryDigest::new(snapshot.digest, snapshot.tree)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "Snapshot(digest={:?}, entries={})",
            self.digest,
            self.files.len() + self.dirs.len()
        )
    }
}

///
/// A facility for digesting a File and storing its content, when the File is known to exist
/// somewhere reachable by the implementer.
///
pub trait StoreFileByDigest<Error> {
    fn store_by_digest(&self, file: File) -> BoxFuture<'static, Result<Digest, Error>>;
}

///
/// A StoreFileByDigest which reads files from a PosixFS and stores them, with no
/// memoisation: appropriate for one-shot captures such as process outputs. Longer-lived
/// callers should memoise through the engine's graph instead.
///
#[derive(Clone)]
pub struct OneOffStoreFileByDigest {
    store: Store,
    posix_fs: Arc<PosixFS>,
    immutable: bool,
}

impl OneOffStoreFileByDigest {
    pub fn new(store: Store, posix_fs: Arc<PosixFS>, immutable: bool) -> OneOffStoreFileByDigest {
        OneOffStoreFileByDigest {
            store,
            posix_fs,
            immutable,
        }
    }
}

impl StoreFileByDigest<String> for OneOffStoreFileByDigest {
    fn store_by_digest(&self, file: File) -> BoxFuture<'static, Result<Digest, String>> {
        let store = self.store.clone();
        let posix_fs = self.posix_fs.clone();
        let immutable = self.immutable;
        async move {
            let path = posix_fs.file_path(&file);
            store.store_file(true, immutable, path).await
        }
        .boxed()
    }
}
