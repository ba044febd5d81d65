// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_oncecell::OnceCell;
use bytes::Bytes;
use fingerprint::{AgedFingerprint, Digest, EMPTY_DIGEST, Fingerprint, async_copy_and_hash};
use futures::future::{self, try_join, try_join_all};
use kvstore::ShardedLmdb;
use parking_lot::Mutex;
use pool::Executor;
use tempfile::Builder;
use tokio::io::AsyncWriteExt;

use crate::{EntryType, LocalOptions};

/// Blobs this large or larger are stored as standalone read-only files on disk rather than
/// inside LMDB, named by hex fingerprint under a two-level fanout.
pub(crate) const LARGE_FILE_SIZE_LIMIT: usize = 512 * 1024;

///
/// The large-blob pool: standalone files under `<root>/<2 hex chars>/<hex fingerprint>`.
///
/// Writes go through a temp file in the final directory followed by a rename, and are
/// single-flighted per fingerprint, so concurrent writers of identical content converge
/// without observing partial writes.
///
#[derive(Debug, Clone)]
pub(crate) struct ShardedFsdb {
    root: PathBuf,
    executor: Executor,
    lease_time: Duration,
    dest_initializer: Arc<Mutex<HashMap<Fingerprint, Arc<OnceCell<()>>>>>,
}

impl ShardedFsdb {
    pub(crate) fn new(root: PathBuf, executor: Executor, lease_time: Duration) -> ShardedFsdb {
        ShardedFsdb {
            root,
            executor,
            lease_time,
            dest_initializer: Arc::new(Mutex::default()),
        }
    }

    pub(crate) fn get_path(&self, fingerprint: Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(hex.get(0..2).unwrap()).join(hex)
    }

    async fn exists(&self, fingerprint: Fingerprint) -> bool {
        tokio::fs::metadata(self.get_path(fingerprint)).await.is_ok()
    }

    async fn exists_batch(
        &self,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<HashSet<Fingerprint>, String> {
        let results = future::join_all(
            fingerprints
                .iter()
                .map(|fingerprint| tokio::fs::metadata(self.get_path(*fingerprint))),
        )
        .await;
        Ok(results
            .into_iter()
            .zip(fingerprints)
            .filter_map(|(result, fingerprint)| result.ok().map(|_| fingerprint))
            .collect())
    }

    async fn lease(&self, fingerprint: Fingerprint) -> Result<(), String> {
        let path = self.get_path(fingerprint);
        self.executor
            .spawn_blocking(
                move || {
                    fs_set_times::set_mtime(&path, fs_set_times::SystemTimeSpec::SymbolicNow)
                        .map_err(|e| format!("Failed to extend mtime of {path:?}: {e}"))
                },
                |e| Err(format!("`lease` task failed: {e}")),
            )
            .await
    }

    async fn remove(&self, fingerprint: Fingerprint) -> bool {
        let _ = self.dest_initializer.lock().remove(&fingerprint);
        tokio::fs::remove_file(self.get_path(fingerprint)).await.is_ok()
    }

    pub(crate) async fn write_bytes(
        &self,
        fingerprint: Fingerprint,
        bytes: Bytes,
    ) -> Result<(), String> {
        self.write_using(fingerprint, |mut file| async move {
            file.write_all(&bytes)
                .await
                .map_err(|e| format!("Failed to write bytes: {e}"))?;
            Ok(file)
        })
        .await
    }

    async fn write_using<F, Fut>(&self, fingerprint: Fingerprint, writer_func: F) -> Result<(), String>
    where
        F: FnOnce(tokio::fs::File) -> Fut,
        Fut: std::future::Future<Output = Result<tokio::fs::File, String>>,
    {
        let cell = self
            .dest_initializer
            .lock()
            .entry(fingerprint)
            .or_default()
            .clone();
        cell.get_or_try_init(async {
            let dest_path = self.get_path(fingerprint);
            tokio::fs::create_dir_all(dest_path.parent().unwrap())
                .await
                .map_err(|e| {
                    format!("Failed to create local store subdirectory {dest_path:?}: {e}")
                })?;

            // The temp file shares the final file's directory so that the rename below never
            // crosses a filesystem boundary.
            let dest_path2 = dest_path.clone();
            let named_temp_file = self
                .executor
                .spawn_blocking(
                    move || {
                        Builder::new()
                            .suffix(".tmp")
                            .tempfile_in(dest_path2.parent().unwrap())
                            .map_err(|e| format!("Failed to create temp file: {e}"))
                    },
                    |e| Err(format!("temp file creation task failed: {e}")),
                )
                .await?;
            let (std_file, tmp_path) = named_temp_file
                .keep()
                .map_err(|e| format!("Failed to keep temp file: {e}"))?;

            match writer_func(std_file.into()).await {
                Ok(mut tokio_file) => {
                    tokio_file
                        .shutdown()
                        .await
                        .map_err(|e| format!("Failed to shutdown {tmp_path:?}: {e}"))?;
                    tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o555))
                        .await
                        .map_err(|e| format!("Failed to set permissions on {tmp_path:?}: {e}"))?;
                    // Sync before renaming, so that the entry is never visible with
                    // unpersisted content.
                    tokio_file
                        .sync_all()
                        .await
                        .map_err(|e| format!("Failed to sync {tmp_path:?}: {e}"))?;
                    tokio::fs::rename(tmp_path.clone(), dest_path.clone())
                        .await
                        .map_err(|e| format!("Error while renaming: {e}."))?;
                    Ok(())
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(tmp_path).await;
                    Err(e)
                }
            }
        })
        .await
        .cloned()
    }

    async fn load_bytes_with<
        T: Send + 'static,
        F: FnMut(&[u8]) -> Result<T, String> + Send + Sync + 'static,
    >(
        &self,
        fingerprint: Fingerprint,
        mut f: F,
    ) -> Result<Option<T>, String> {
        match tokio::fs::read(self.get_path(fingerprint)).await {
            Ok(contents) => Ok(Some(f(&contents[..])?)),
            Err(_) => Ok(None),
        }
    }

    async fn aged_fingerprints(&self) -> Result<Vec<AgedFingerprint>, String> {
        // Where the LMDB store records a lease expiry instant, this store instead treats a
        // file as expired when its mtime falls outside the lease window.
        let root = self.root.clone();
        let expiration_time = SystemTime::now() - self.lease_time;
        self.executor
            .spawn_blocking(
                move || {
                    let mut fingerprints = vec![];
                    let Ok(shards) = std::fs::read_dir(&root) else {
                        return Ok(fingerprints);
                    };
                    for entry in shards {
                        let shard =
                            entry.map_err(|e| format!("Error iterating dir {root:?}: {e}."))?;
                        if !shard.path().is_dir() {
                            continue;
                        }
                        let large_files = std::fs::read_dir(shard.path())
                            .map_err(|e| format!("Failed to read shard directory: {e}."))?;
                        for entry in large_files {
                            let large_file = entry.map_err(|e| {
                                format!("Error iterating dir {:?}: {e}", shard.path().file_name())
                            })?;
                            let path = large_file.path();
                            if path.extension().is_some() {
                                // A not-yet-renamed tempfile.
                                continue;
                            }

                            let hash = path.file_name().unwrap().to_str().unwrap();
                            let (length, mtime) = large_file
                                .metadata()
                                .and_then(|metadata| {
                                    let length = metadata.len();
                                    let mtime = metadata.modified()?;
                                    Ok((length, mtime))
                                })
                                .map_err(|e| {
                                    format!("Could not access metadata for {path:?}: {e}")
                                })?;

                            let expired_seconds_ago = expiration_time
                                .duration_since(mtime)
                                .map(|t| t.as_secs())
                                // 0 indicates unexpired.
                                .unwrap_or(0);

                            fingerprints.push(AgedFingerprint {
                                expired_seconds_ago,
                                fingerprint: Fingerprint::from_hex_string(hash).map_err(|e| {
                                    format!("Invalid file store entry at {path:?}: {e}")
                                })?,
                                size_bytes: length,
                            });
                        }
                    }
                    Ok(fingerprints)
                },
                |e| Err(format!("`aged_fingerprints` task failed: {e}")),
            )
            .await
    }
}

///
/// The local backing of the content-addressed store: files and directories in separate LMDB
/// namespaces (so that directory payloads can be trusted to parse as protos), with large
/// file blobs spilled to the fanout filesystem pool.
///
#[derive(Debug, Clone)]
pub struct ByteStore {
    inner: Arc<InnerStore>,
}

#[derive(Debug)]
struct InnerStore {
    file_lmdb: Arc<ShardedLmdb>,
    directory_lmdb: Arc<ShardedLmdb>,
    file_fsdb: ShardedFsdb,
}

impl ByteStore {
    pub fn new<P: AsRef<Path>>(executor: Executor, path: P) -> Result<ByteStore, String> {
        Self::new_with_options(executor, path, LocalOptions::default())
    }

    pub fn new_with_options<P: AsRef<Path>>(
        executor: Executor,
        path: P,
        options: LocalOptions,
    ) -> Result<ByteStore, String> {
        let root = path.as_ref();
        let lmdb_files_root = root.join("files");
        let lmdb_directories_root = root.join("directories");
        let fsdb_files_root = root.join("immutable").join("files");

        std::fs::create_dir_all(root)
            .map_err(|e| format!("Failed to create {}: {e}", root.display()))?;
        std::fs::create_dir_all(&fsdb_files_root)
            .map_err(|e| format!("Failed to create {}: {e}", fsdb_files_root.display()))?;

        Ok(ByteStore {
            inner: Arc::new(InnerStore {
                file_lmdb: Arc::new(ShardedLmdb::new(
                    lmdb_files_root,
                    options.files_max_size_bytes,
                    executor.clone(),
                    options.lease_time,
                    options.shard_count,
                )?),
                directory_lmdb: Arc::new(ShardedLmdb::new(
                    lmdb_directories_root,
                    options.directories_max_size_bytes,
                    executor.clone(),
                    options.lease_time,
                    options.shard_count,
                )?),
                file_fsdb: ShardedFsdb::new(fsdb_files_root, executor, options.lease_time),
            }),
        })
    }

    pub(crate) fn should_use_fsdb(entry_type: EntryType, len: u64) -> bool {
        entry_type == EntryType::File && len >= LARGE_FILE_SIZE_LIMIT as u64
    }

    fn lmdb_for(&self, entry_type: EntryType) -> &Arc<ShardedLmdb> {
        match entry_type {
            EntryType::File => &self.inner.file_lmdb,
            EntryType::Directory => &self.inner.directory_lmdb,
        }
    }

    ///
    /// The path that the given digest is persisted at on the filesystem, if it lives in the
    /// large-blob pool.
    ///
    pub async fn load_from_fs(&self, digest: Digest) -> Result<Option<PathBuf>, String> {
        if self.inner.file_fsdb.exists(digest.hash).await {
            return Ok(Some(self.inner.file_fsdb.get_path(digest.hash)));
        }
        Ok(None)
    }

    pub async fn entry_type(&self, fingerprint: Fingerprint) -> Result<Option<EntryType>, String> {
        if fingerprint == EMPTY_DIGEST.hash {
            // Valid as both; report Directory so that callers checking whether it _can_ be
            // one succeed.
            return Ok(Some(EntryType::Directory));
        }

        let is_lmdb_dir = self.inner.directory_lmdb.exists(fingerprint);
        let is_lmdb_file = self.inner.file_lmdb.exists(fingerprint);
        let is_fsdb_file = self.inner.file_fsdb.exists(fingerprint);
        let (is_lmdb_dir, is_lmdb_file) = try_join(is_lmdb_dir, is_lmdb_file).await?;
        match (is_lmdb_dir, is_lmdb_file, is_fsdb_file.await) {
            (true, _, _) => Ok(Some(EntryType::Directory)),
            (_, true, _) | (_, _, true) => Ok(Some(EntryType::File)),
            _ => Ok(None),
        }
    }

    pub async fn store_bytes(
        &self,
        entry_type: EntryType,
        fingerprint: Fingerprint,
        bytes: Bytes,
        initial_lease: bool,
    ) -> Result<(), String> {
        self.store_bytes_batch(entry_type, vec![(fingerprint, bytes)], initial_lease)
            .await
    }

    pub async fn store_bytes_batch(
        &self,
        entry_type: EntryType,
        items: Vec<(Fingerprint, Bytes)>,
        initial_lease: bool,
    ) -> Result<(), String> {
        let mut fsdb_items = vec![];
        let mut lmdb_items = vec![];
        for (fingerprint, bytes) in items {
            if Self::should_use_fsdb(entry_type, bytes.len() as u64) {
                fsdb_items.push((fingerprint, bytes));
            } else {
                lmdb_items.push((fingerprint, bytes));
            }
        }

        try_join(
            try_join_all(
                fsdb_items
                    .into_iter()
                    .map(|(fingerprint, bytes)| {
                        self.inner.file_fsdb.write_bytes(fingerprint, bytes)
                    }),
            ),
            self.lmdb_for(entry_type)
                .store_bytes_batch(lmdb_items, initial_lease),
        )
        .await?;
        Ok(())
    }

    ///
    /// Stores the content of the file at `src` without buffering it into memory, returning
    /// its digest.
    ///
    pub async fn store(
        &self,
        entry_type: EntryType,
        initial_lease: bool,
        src_is_immutable: bool,
        src: PathBuf,
    ) -> Result<Digest, String> {
        let digest = {
            let mut file = tokio::fs::File::open(&src)
                .await
                .map_err(|e| format!("Failed to open {src:?}: {e}"))?;
            async_copy_and_hash(&mut file, &mut tokio::io::sink())
                .await
                .map_err(|e| format!("Failed to hash {src:?}: {e}"))?
        };

        if Self::should_use_fsdb(entry_type, digest.size_bytes) {
            let src2 = src.clone();
            self.inner
                .file_fsdb
                .write_using(digest.hash, |mut file| async move {
                    let mut reader = tokio::fs::File::open(&src2)
                        .await
                        .map_err(|e| format!("Failed to open {src2:?}: {e}"))?;
                    let matched = fingerprint::async_verified_copy(
                        digest,
                        src_is_immutable,
                        &mut reader,
                        &mut file,
                    )
                    .await
                    .map_err(|e| format!("Failed to copy {src2:?}: {e}"))?;
                    if matched {
                        Ok(file)
                    } else {
                        Err(format!("Input {src2:?} changed while reading."))
                    }
                })
                .await?;
        } else {
            self.lmdb_for(entry_type)
                .store(initial_lease, src_is_immutable, digest, move || {
                    std::fs::File::open(&src)
                })
                .await?;
        }

        Ok(digest)
    }

    ///
    /// The subset of the given digests not present in this store.
    ///
    pub async fn get_missing_digests(
        &self,
        entry_type: EntryType,
        digests: HashSet<Digest>,
    ) -> Result<HashSet<Digest>, String> {
        let mut fsdb_digests = vec![];
        let mut lmdb_digests = vec![];
        for digest in digests.iter() {
            if Self::should_use_fsdb(entry_type, digest.size_bytes) {
                fsdb_digests.push(digest.hash);
            }
            // The empty digest is always present without I/O, which allows digest
            // operations (like merges) to work without first storing it.
            else if *digest != EMPTY_DIGEST {
                lmdb_digests.push(digest.hash);
            }
        }

        let (mut existing, existing_lmdb) = try_join(
            self.inner.file_fsdb.exists_batch(fsdb_digests),
            self.lmdb_for(entry_type).exists_batch(lmdb_digests),
        )
        .await?;
        existing.extend(existing_lmdb);

        Ok(digests
            .into_iter()
            .filter(|digest| *digest != EMPTY_DIGEST && !existing.contains(&digest.hash))
            .collect())
    }

    ///
    /// Loads bytes from the store, passing them to `f` as a slice (for the LMDB backends,
    /// directly into shared memory). The entry's length is validated against the digest.
    ///
    pub async fn load_bytes_with<
        T: Send + 'static,
        F: FnMut(&[u8]) -> T + Send + Sync + 'static,
    >(
        &self,
        entry_type: EntryType,
        digest: Digest,
        mut f: F,
    ) -> Result<Option<T>, String> {
        if digest == EMPTY_DIGEST {
            // No I/O for the empty digest.
            return Ok(Some(f(&[])));
        }

        let len_checked_f = move |bytes: &[u8]| {
            if bytes.len() as u64 == digest.size_bytes {
                Ok(f(bytes))
            } else {
                Err(format!(
                    "Got hash collision reading from store - digest {:?} was requested, but \
           retrieved bytes with that fingerprint had length {}. Congratulations, you may \
           have broken sha256!",
                    digest,
                    bytes.len(),
                ))
            }
        };

        if Self::should_use_fsdb(entry_type, digest.size_bytes) {
            self.inner
                .file_fsdb
                .load_bytes_with(digest.hash, len_checked_f)
                .await
        } else {
            self.lmdb_for(entry_type)
                .load_bytes_with(digest.hash, len_checked_f)
                .await
        }
    }

    pub async fn remove(&self, entry_type: EntryType, digest: Digest) -> Result<bool, String> {
        match entry_type {
            EntryType::Directory => self.inner.directory_lmdb.remove(digest.hash).await,
            EntryType::File if Self::should_use_fsdb(entry_type, digest.size_bytes) => {
                Ok(self.inner.file_fsdb.remove(digest.hash).await)
            }
            EntryType::File => self.inner.file_lmdb.remove(digest.hash).await,
        }
    }

    pub async fn lease_all(
        &self,
        digests: impl Iterator<Item = (Digest, EntryType)>,
    ) -> Result<(), String> {
        // Lease extension happens periodically in the background, so this needn't be
        // parallel.
        for (digest, entry_type) in digests {
            if Self::should_use_fsdb(entry_type, digest.size_bytes) {
                self.inner.file_fsdb.lease(digest.hash).await?;
            } else {
                self.lmdb_for(entry_type)
                    .lease(digest.hash)
                    .await
                    .map_err(|err| format!("Error leasing digest {digest:?}: {err}"))?;
            }
        }
        Ok(())
    }

    ///
    /// All stored entries with their lease ages, tagged with the backend they must be
    /// removed from.
    ///
    pub async fn aged_entries(&self) -> Result<Vec<(AgedFingerprint, EntryType)>, String> {
        let (files, directories, fsdb_files) = futures::try_join!(
            self.inner.file_lmdb.all_fingerprints(),
            self.inner.directory_lmdb.all_fingerprints(),
            self.inner.file_fsdb.aged_fingerprints(),
        )?;
        let mut entries = Vec::with_capacity(files.len() + directories.len() + fsdb_files.len());
        entries.extend(files.into_iter().map(|af| (af, EntryType::File)));
        entries.extend(directories.into_iter().map(|af| (af, EntryType::Directory)));
        entries.extend(fsdb_files.into_iter().map(|af| (af, EntryType::File)));
        Ok(entries)
    }

    pub async fn all_digests(&self, entry_type: EntryType) -> Result<Vec<Digest>, String> {
        let mut digests = vec![];
        for af in self.lmdb_for(entry_type).all_fingerprints().await? {
            digests.push(Digest::new(af.fingerprint, af.size_bytes));
        }
        if entry_type == EntryType::File {
            for af in self.inner.file_fsdb.aged_fingerprints().await? {
                digests.push(Digest::new(af.fingerprint, af.size_bytes));
            }
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod local_tests;
