// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A content-addressed store of file blobs and directory trees, with local on-disk backing
//! and an optional remote mirror which is probed (and backfilled from) on local misses.

mod local;
#[cfg(test)]
mod local_tests;
mod snapshot;
pub use crate::snapshot::{OneOffStoreFileByDigest, Snapshot, StoreFileByDigest};
mod snapshot_ops;
pub use crate::snapshot_ops::{SnapshotOps, SnapshotOpsError, SubsetParams};
#[cfg(test)]
mod snapshot_tests;
#[cfg(test)]
mod tests;

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Display};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fingerprint::{Digest, EMPTY_DIGEST};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use log::debug;
use reapi::MessageExt;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;
use remote::{ByteStoreProvider, ReapiByteStoreProvider, RemoteStoreOptions};
use vfs::directory::{DigestTrie, Entry};
use vfs::{DigestEntry, DirectoryDigest, FileContent, FileEntry, Permissions, RelativePath, SymlinkBehavior, SymlinkEntry};

const MEGABYTES: usize = 1024 * 1024;
const GIGABYTES: usize = 1024 * MEGABYTES;

/// The target number of bytes for the local store after garbage collection.
pub const DEFAULT_LOCAL_STORE_GC_TARGET_BYTES: u64 = 4 * GIGABYTES as u64;

/// Per-namespace sizing and lease options for the local store.
#[derive(Clone)]
pub struct LocalOptions {
    pub files_max_size_bytes: usize,
    pub directories_max_size_bytes: usize,
    pub lease_time: Duration,
    pub shard_count: u8,
}

impl Default for LocalOptions {
    fn default() -> Self {
        LocalOptions {
            files_max_size_bytes: 16 * GIGABYTES,
            directories_max_size_bytes: 2 * GIGABYTES,
            lease_time: kvstore::DEFAULT_LEASE_TIME,
            shard_count: 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EntryType {
    Directory,
    File,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    /// A Digest was not present in either of the stores. This is a soft error: a caller
    /// which produced the Digest may be able to re-produce and re-store it (see the engine's
    /// backtracking).
    MissingDigest(String, Digest),
    /// All other error types.
    Unclassified(String),
}

impl StoreError {
    pub fn enrich(self, prefix: &str) -> Self {
        match self {
            Self::MissingDigest(s, d) => Self::MissingDigest(format!("{prefix}: {s}"), d),
            Self::Unclassified(s) => Self::Unclassified(format!("{prefix}: {s}")),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDigest(s, d) => {
                write!(f, "{s}: {d:?}")
            }
            Self::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

#[derive(Clone)]
struct RemoteStore {
    provider: Arc<dyn ByteStoreProvider>,
}

impl Debug for RemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore").finish_non_exhaustive()
    }
}

///
/// A content-addressed store of file contents and directories.
///
/// Keeps content on disk, optionally backfilling its local storage from a remote store which
/// implements the REAPI CAS contract. Writes back to the remote only when explicitly asked
/// to (`ensure_remote_has_recursive`).
///
/// Directories are a standalone concept rather than a buffer of bytes, which lets the store
/// trust them to be valid and canonical.
///
#[derive(Debug, Clone)]
pub struct Store {
    local: local::ByteStore,
    remote: Option<RemoteStore>,
}

impl Store {
    ///
    /// Make a store which only uses its local storage.
    ///
    pub fn local_only<P: AsRef<Path>>(
        executor: pool::Executor,
        path: P,
    ) -> Result<Store, String> {
        Ok(Store {
            local: local::ByteStore::new(executor, path)?,
            remote: None,
        })
    }

    pub fn local_only_with_options<P: AsRef<Path>>(
        executor: pool::Executor,
        path: P,
        options: LocalOptions,
    ) -> Result<Store, String> {
        Ok(Store {
            local: local::ByteStore::new_with_options(executor, path, options)?,
            remote: None,
        })
    }

    ///
    /// Converts this Store into one which will backfill its local storage from the given
    /// remote CAS on misses.
    ///
    pub async fn into_with_remote(self, options: RemoteStoreOptions) -> Result<Store, String> {
        Ok(Store {
            local: self.local,
            remote: Some(RemoteStore {
                provider: Arc::new(ReapiByteStoreProvider::new(options).await?),
            }),
        })
    }

    /// The default location for the local store, under the user cache dir.
    pub fn default_path() -> PathBuf {
        vfs::default_cache_path().join("lmdb_store")
    }

    ///
    /// Store a file's bytes locally.
    ///
    pub async fn store_file_bytes(
        &self,
        bytes: Bytes,
        initial_lease: bool,
    ) -> Result<Digest, String> {
        let digest = Digest::of_bytes(&bytes);
        self.local
            .store_bytes(EntryType::File, digest.hash, bytes, initial_lease)
            .await?;
        Ok(digest)
    }

    ///
    /// Store file bytes for which digests have already been computed.
    ///
    pub async fn store_file_bytes_batch(
        &self,
        items: Vec<(Digest, Bytes)>,
        initial_lease: bool,
    ) -> Result<(), String> {
        if cfg!(debug_assertions) {
            for (digest, bytes) in &items {
                assert_eq!(Digest::of_bytes(bytes), *digest);
            }
        }
        self.local
            .store_bytes_batch(
                EntryType::File,
                items
                    .into_iter()
                    .map(|(digest, bytes)| (digest.hash, bytes))
                    .collect(),
                initial_lease,
            )
            .await
    }

    ///
    /// Store the content of the file at the given (absolute) path without buffering it all
    /// into memory.
    ///
    pub async fn store_file(
        &self,
        initial_lease: bool,
        data_is_immutable: bool,
        src: PathBuf,
    ) -> Result<Digest, String> {
        self.local
            .store(EntryType::File, initial_lease, data_is_immutable, src)
            .await
    }

    ///
    /// Persist every Directory of the given trie to the local store, returning a
    /// `DirectoryDigest` which is valid to pass across process boundaries.
    ///
    pub async fn record_digest_trie(
        &self,
        tree: DigestTrie,
        initial_lease: bool,
    ) -> Result<DirectoryDigest, String> {
        let root_digest = tree.compute_root_digest();

        // Collect the root and every transitive sub-Directory in canonical proto form.
        let mut directories = vec![(root_digest.hash, tree.as_remexec_directory().to_bytes())];
        tree.walk(SymlinkBehavior::Aware, &mut |_, entry| {
            if let Entry::Directory(d) = entry {
                if !d.name().is_empty() {
                    directories.push((d.digest().hash, d.as_remexec_directory().to_bytes()));
                }
            }
        });

        self.local
            .store_bytes_batch(EntryType::Directory, directories, initial_lease)
            .await?;
        Ok(DirectoryDigest::new(root_digest, tree))
    }

    ///
    /// Load the given DirectoryDigest's trie, either from memory or by (transitively)
    /// loading its serialised Directories from the local store or the remote.
    ///
    pub async fn load_digest_trie(&self, dd: DirectoryDigest) -> Result<DigestTrie, StoreError> {
        if let Some(tree) = dd.tree {
            return Ok(tree);
        }

        // The trie was discarded (the digest crossed a process boundary): reconstitute it by
        // walking the persisted Directory protos breadth first.
        let root_digest = dd.as_digest();
        let mut directories_by_digest = HashMap::new();
        let mut to_load = VecDeque::new();
        to_load.push_back(root_digest);
        while let Some(digest) = to_load.pop_front() {
            if directories_by_digest.contains_key(&digest) {
                continue;
            }
            let directory = self.load_directory(digest).await?.ok_or_else(|| {
                StoreError::MissingDigest("Could not load root directory".to_owned(), digest)
            })?;
            for child in &directory.directories {
                to_load.push_back(reapi::require_digest(&child.digest)?);
            }
            directories_by_digest.insert(digest, directory);
        }

        let root = directories_by_digest.remove(&root_digest).unwrap();
        let tree = DigestTrie::from_remexec_directories(&root, &directories_by_digest)?;
        if cfg!(debug_assertions) {
            let computed = tree.compute_root_digest();
            assert!(
                computed == root_digest,
                "Loaded tree did not match its digest: expected {root_digest:?}, got {computed:?}"
            );
        }
        Ok(tree)
    }

    ///
    /// Load a DirectoryDigest for a Digest which is known to have been persisted (here or
    /// remotely).
    ///
    pub async fn load_directory_digest(&self, digest: Digest) -> Result<DirectoryDigest, StoreError> {
        let tree = self
            .load_digest_trie(DirectoryDigest::from_persisted_digest(digest))
            .await?;
        Ok(DirectoryDigest::new(digest, tree))
    }

    ///
    /// Load a single level of directory, verifying its canonicality.
    ///
    pub async fn load_directory(
        &self,
        digest: Digest,
    ) -> Result<Option<remexec::Directory>, StoreError> {
        self.load_bytes_with(EntryType::Directory, digest, move |bytes| {
            let directory = prost::Message::decode(bytes)
                .map_err(|e| format!("LMDB corruption: Directory bytes for {digest:?} were not decodable: {e:?}"))?;
            reapi::verify_directory_canonical(digest, &directory)?;
            Ok(directory)
        })
        .await
        .map(Some)
        .or_else(|err| match err {
            StoreError::MissingDigest(..) => Ok(None),
            err => Err(err),
        })
    }

    ///
    /// Loads the bytes of the file with the passed digest, backfilling from the remote on a
    /// local miss.
    ///
    pub async fn load_file_bytes_with<
        T: Send + 'static,
        F: Fn(&[u8]) -> T + Clone + Send + Sync + 'static,
    >(
        &self,
        digest: Digest,
        f: F,
    ) -> Result<T, StoreError> {
        self.load_bytes_with(EntryType::File, digest, move |bytes| Ok(f(bytes)))
            .await
    }

    async fn load_bytes_with<
        T: Send + 'static,
        F: FnMut(&[u8]) -> Result<T, String> + Clone + Send + Sync + 'static,
    >(
        &self,
        entry_type: EntryType,
        digest: Digest,
        f: F,
    ) -> Result<T, StoreError> {
        match self.local.load_bytes_with(entry_type, digest, f.clone()).await {
            Ok(Some(Ok(value))) => return Ok(value),
            Ok(Some(Err(corruption))) => {
                // Corrupt content is evicted and treated as missing, so that a re-fetch (or
                // backtracking re-computation) can heal it.
                debug!("Evicting corrupt entry {digest:?}: {corruption}");
                let _ = self.local.remove(entry_type, digest).await?;
            }
            Ok(None) => (),
            Err(err) => return Err(err.into()),
        }

        // Miss: probe the remote, and backfill locally on success.
        if let Some(remote) = &self.remote {
            let mut destination = Vec::with_capacity(digest.size_bytes as usize);
            let found = remote
                .provider
                .load(digest, &mut destination)
                .await
                .map_err(StoreError::Unclassified)?;
            if found {
                let bytes = Bytes::from(destination);
                if Digest::of_bytes(&bytes) != digest {
                    return Err(StoreError::Unclassified(format!(
                        "The remote CAS returned incorrect bytes for {digest:?}."
                    )));
                }
                self.local
                    .store_bytes(entry_type, digest.hash, bytes.clone(), true)
                    .await?;
                let mut f = f;
                return f(&bytes).map_err(StoreError::Unclassified);
            }
        }

        Err(StoreError::MissingDigest(
            format!("Was not present in either the local or remote store ({entry_type:?})"),
            digest,
        ))
    }

    ///
    /// Ensures that every file of the given tree is present in the local store, fetching
    /// from the remote as necessary.
    ///
    pub async fn ensure_local_has_recursive_directory(
        &self,
        dir_digest: DirectoryDigest,
    ) -> Result<(), StoreError> {
        let tree = self.load_digest_trie(dir_digest).await?;
        let mut file_digests = Vec::new();
        tree.walk(SymlinkBehavior::Aware, &mut |_, entry| {
            if let Entry::File(f) = entry {
                file_digests.push(f.digest());
            }
        });

        let missing = self
            .local
            .get_missing_digests(EntryType::File, file_digests.into_iter().collect())
            .await?;
        try_join_all(
            missing
                .into_iter()
                .map(|file_digest| self.ensure_local_has_file(file_digest)),
        )
        .await?;
        Ok(())
    }

    ///
    /// Ensures that the given file is present locally, fetching it from the remote if
    /// necessary.
    ///
    pub async fn ensure_local_has_file(&self, file_digest: Digest) -> Result<(), StoreError> {
        self.load_file_bytes_with(file_digest, |_| ()).await
    }

    ///
    /// Ensures that the remote has every given digest, and everything transitively
    /// reachable from tree digests among them. Returns an error if there is no remote
    /// configured.
    ///
    pub async fn ensure_remote_has_recursive(
        &self,
        digests: Vec<Digest>,
    ) -> Result<(), StoreError> {
        let remote = self.remote.clone().ok_or_else(|| {
            StoreError::Unclassified("Cannot upload to remote: none is configured.".to_owned())
        })?;

        // Expand tree digests into their transitive contents.
        let mut expanded: HashSet<Digest> = HashSet::new();
        for digest in digests {
            if expanded.contains(&digest) {
                continue;
            }
            match self.local.entry_type(digest.hash).await? {
                Some(EntryType::File) => {
                    expanded.insert(digest);
                }
                Some(EntryType::Directory) | None => {
                    // A digest that is not present locally at all may still be a
                    // directory persisted only remotely; try to expand it as one, and
                    // surface MissingDigest otherwise.
                    let tree = self
                        .load_digest_trie(DirectoryDigest::from_persisted_digest(digest))
                        .await?;
                    expanded.insert(digest);
                    for sub_digest in tree.digests() {
                        expanded.insert(sub_digest);
                    }
                    tree.walk(SymlinkBehavior::Aware, &mut |_, entry| {
                        if let Entry::Directory(d) = entry {
                            expanded.insert(d.digest());
                        }
                    });
                }
            }
        }

        let missing = remote
            .provider
            .list_missing_digests(&mut expanded.into_iter())
            .await
            .map_err(StoreError::Unclassified)?;

        try_join_all(missing.into_iter().map(|digest| {
            let remote = remote.clone();
            async move {
                if digest == EMPTY_DIGEST {
                    return Ok(());
                }
                let entry_type = self
                    .local
                    .entry_type(digest.hash)
                    .await?
                    .ok_or_else(|| {
                        StoreError::MissingDigest(
                            "Failed to upload: was not present locally".to_owned(),
                            digest,
                        )
                    })?;

                // Large file blobs are persisted on disk: upload them from their file
                // handles rather than buffering.
                if entry_type == EntryType::File {
                    if let Some(path) = self.local.load_from_fs(digest).await? {
                        let file = tokio::fs::File::open(&path)
                            .await
                            .map_err(|e| format!("Failed to open {path:?}: {e}"))?;
                        return remote
                            .provider
                            .store_file(digest, file)
                            .await
                            .map_err(StoreError::Unclassified);
                    }
                }

                let bytes = self
                    .load_bytes_with(entry_type, digest, |bytes| {
                        Ok(Bytes::copy_from_slice(bytes))
                    })
                    .await?;
                remote
                    .provider
                    .store_bytes(digest, bytes)
                    .await
                    .map_err(StoreError::Unclassified)
            }
        }))
        .await?;
        Ok(())
    }

    ///
    /// Extend the leases of the given digests, preventing their garbage collection for the
    /// duration of a session.
    ///
    pub async fn lease_all(
        &self,
        digests: impl Iterator<Item = (Digest, EntryType)>,
    ) -> Result<(), String> {
        self.local.lease_all(digests).await
    }

    ///
    /// Attempts to shrink the local store to at most `target_size_bytes`, preferring the
    /// least recently leased entries and never deleting entries with live leases.
    ///
    /// Returns the size the store was shrunk to, which may exceed the target when live
    /// leases keep it above the high-water mark.
    ///
    pub async fn garbage_collect(&self, target_size_bytes: u64) -> Result<u64, String> {
        let mut used_bytes: u64 = 0;
        let mut entries_by_expiry = BinaryHeap::new();
        for (aged, entry_type) in self.local.aged_entries().await? {
            used_bytes += aged.size_bytes;
            entries_by_expiry.push((aged, entry_type));
        }

        while used_bytes > target_size_bytes {
            let Some((aged, entry_type)) = entries_by_expiry.pop() else {
                break;
            };
            if aged.expired_seconds_ago == 0 {
                // Everything remaining is leased: stop, even though the target was missed.
                debug!(
                    "Garbage collection stopping at {used_bytes} bytes: all remaining entries are leased"
                );
                break;
            }
            self.local
                .remove(
                    entry_type,
                    Digest::new(aged.fingerprint, aged.size_bytes),
                )
                .await?;
            used_bytes -= aged.size_bytes;
        }

        Ok(used_bytes)
    }

    /// Removes the given file from the local store, returning true if it was present.
    pub async fn remove_file(&self, digest: Digest) -> Result<bool, String> {
        self.local.remove(EntryType::File, digest).await
    }

    pub async fn all_local_digests(&self, entry_type: EntryType) -> Result<Vec<Digest>, String> {
        self.local.all_digests(entry_type).await
    }

    ///
    /// The contents of every file in the given tree, loaded eagerly.
    ///
    pub async fn contents_for_directory(
        &self,
        digest: DirectoryDigest,
    ) -> Result<Vec<FileContent>, StoreError> {
        let mut files = Vec::new();
        self.load_digest_trie(digest)
            .await?
            .walk(SymlinkBehavior::Oblivious, &mut |path, entry| {
                if let Entry::File(f) = entry {
                    files.push((path.to_owned(), f.digest(), f.is_executable()));
                }
            });

        try_join_all(files.into_iter().map(|(path, digest, is_executable)| {
            let store = self.clone();
            async move {
                let content = store
                    .load_file_bytes_with(digest, Bytes::copy_from_slice)
                    .await
                    .map_err(|err| err.enrich(&format!("Couldn't find file contents for {path:?}")))?;
                Ok::<_, StoreError>(FileContent {
                    path,
                    content,
                    is_executable,
                })
            }
        }))
        .await
    }

    ///
    /// The leaf entries (files, symlinks, empty directories) of the given tree, without
    /// loading file content.
    ///
    pub async fn entries_for_directory(
        &self,
        digest: DirectoryDigest,
    ) -> Result<Vec<DigestEntry>, StoreError> {
        if digest.as_digest() == EMPTY_DIGEST {
            return Ok(vec![]);
        }

        let mut entries = Vec::new();
        self.load_digest_trie(digest)
            .await?
            .walk(SymlinkBehavior::Aware, &mut |path, entry| match entry {
                Entry::File(f) => entries.push(DigestEntry::File(FileEntry {
                    path: path.to_owned(),
                    digest: f.digest(),
                    is_executable: f.is_executable(),
                })),
                Entry::Symlink(s) => entries.push(DigestEntry::Symlink(SymlinkEntry {
                    path: path.to_owned(),
                    target: s.target().to_path_buf(),
                })),
                Entry::Directory(d) if d.tree().entries().is_empty() && !d.name().is_empty() => {
                    entries.push(DigestEntry::EmptyDirectory(path.to_owned()));
                }
                Entry::Directory(_) => (),
            });

        Ok(entries)
    }

    ///
    /// Materializes the given tree into `destination`.
    ///
    /// `clear_paths` are moved into a trash directory (under `destination_root`) before
    /// anything is written: renames are atomic-enough, and never follow symlinks. Existing
    /// files with differing content are overwritten, so the operation is idempotent for
    /// identical inputs.
    ///
    pub async fn materialize_directory(
        &self,
        destination: PathBuf,
        destination_root: &Path,
        digest: DirectoryDigest,
        clear_paths: &[RelativePath],
        perms: Permissions,
    ) -> Result<(), StoreError> {
        debug_assert!(destination.starts_with(destination_root));
        debug_assert!(destination.is_absolute());

        // Move cleared paths into a trash directory before writing anything: the rename is
        // atomic per path, and deleting the trash happens after the fact.
        if !clear_paths.is_empty() {
            let trash = tempfile::Builder::new()
                .prefix(".trash-")
                .tempdir_in(destination_root)
                .map_err(|e| format!("Failed to create trash dir: {e}"))?;
            for (i, clear_path) in clear_paths.iter().enumerate() {
                let path = destination.join(clear_path);
                if tokio::fs::symlink_metadata(&path).await.is_ok() {
                    tokio::fs::rename(&path, trash.path().join(i.to_string()))
                        .await
                        .map_err(|e| format!("Failed to move {path:?} to trash: {e}"))?;
                }
            }
            // Dropping the TempDir deletes the trashed content.
        }

        let tree = self.load_digest_trie(digest).await?;
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| format!("Failed to create directory {destination:?}: {e}"))?;
        self.materialize_trie(destination, tree, perms).await
    }

    fn materialize_trie(
        &self,
        destination: PathBuf,
        tree: DigestTrie,
        perms: Permissions,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            let mut child_futures = Vec::new();
            for entry in tree.entries() {
                let path = destination.join(entry.name().as_ref());
                match entry {
                    Entry::Directory(d) => {
                        let child_tree = d.tree().clone();
                        child_futures.push(
                            async move {
                                match tokio::fs::create_dir(&path).await {
                                    Ok(()) => (),
                                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => (),
                                    Err(e) => {
                                        return Err(StoreError::Unclassified(format!(
                                            "Failed to create directory {path:?}: {e}"
                                        )));
                                    }
                                }
                                self.materialize_trie(path, child_tree, perms).await
                            }
                            .boxed(),
                        );
                    }
                    Entry::File(f) => {
                        let digest = f.digest();
                        let is_executable = f.is_executable();
                        child_futures.push(
                            async move {
                                self.materialize_file(path, digest, is_executable, perms).await
                            }
                            .boxed(),
                        );
                    }
                    Entry::Symlink(s) => {
                        let target = s.target().to_path_buf();
                        child_futures.push(
                            async move {
                                // Recreate the link even if a stale one exists.
                                let _ = tokio::fs::remove_file(&path).await;
                                tokio::fs::symlink(&target, &path).await.map_err(|e| {
                                    StoreError::Unclassified(format!(
                                        "Failed to create symlink {path:?} -> {target:?}: {e}"
                                    ))
                                })
                            }
                            .boxed(),
                        );
                    }
                }
            }
            try_join_all(child_futures).await?;
            Ok(())
        }
        .boxed()
    }

    async fn materialize_file(
        &self,
        path: PathBuf,
        digest: Digest,
        is_executable: bool,
        perms: Permissions,
    ) -> Result<(), StoreError> {
        let mode = match (perms, is_executable) {
            (Permissions::ReadOnly, false) => 0o444,
            (Permissions::ReadOnly, true) => 0o555,
            (Permissions::Writable, false) => 0o644,
            (Permissions::Writable, true) => 0o755,
        };

        let bytes = self
            .load_file_bytes_with(digest, Bytes::copy_from_slice)
            .await?;
        // An existing file with different content (or a read-only mode) would make a plain
        // write fail, so clear the destination first.
        let _ = tokio::fs::remove_file(&path).await;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("Failed to write {path:?}: {e}"))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| format!("Failed to set permissions on {path:?}: {e}"))?;
        Ok(())
    }
}
