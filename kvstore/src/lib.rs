// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A content-keyed store over a set of sharded LMDB environments.
//!
//! LMDB allows at most one concurrent writer per environment, so content is sharded over
//! `shard_count` environments selected by the high bits of the stored fingerprint, allowing
//! parallel writes. Each environment holds a content database and a lease database; leases
//! protect entries from garbage collection.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{self, Duration};

use bytes::Bytes;
use fingerprint::{AgedFingerprint, Digest, FINGERPRINT_SIZE, Fingerprint, sync_verified_copy};
use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, RwTransaction, Transaction,
    WriteFlags,
};
use log::trace;

///
/// The lease time is relatively short, because in general entries should be garbage
/// collectible. Leases are written on creation, and extended by the daemon for entries that
/// live sessions hold in memory.
///
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(2 * 60 * 60);

const VERSIONED_FINGERPRINT_SIZE: usize = FINGERPRINT_SIZE + 1;

/// The byte pattern of a Fingerprint with the store schema version appended.
///
/// Bumping the schema version whenever the stored byte format changes keeps data written by
/// different releases from colliding in a shared cache directory.
pub struct VersionedFingerprint([u8; VERSIONED_FINGERPRINT_SIZE]);

impl VersionedFingerprint {
    pub fn new(fingerprint: Fingerprint, version: u8) -> VersionedFingerprint {
        let mut buf = [0; VERSIONED_FINGERPRINT_SIZE];
        buf[0..FINGERPRINT_SIZE].copy_from_slice(&fingerprint.0[..]);
        buf[FINGERPRINT_SIZE] = version;
        VersionedFingerprint(buf)
    }

    pub fn get_fingerprint(&self) -> Fingerprint {
        let mut buf = [0; FINGERPRINT_SIZE];
        buf.copy_from_slice(&self.0[0..FINGERPRINT_SIZE]);
        Fingerprint(buf)
    }

    pub fn from_bytes_unsafe(bytes: &[u8]) -> VersionedFingerprint {
        assert!(
            bytes.len() == VERSIONED_FINGERPRINT_SIZE,
            "Input value was not a versioned fingerprint; had length: {}",
            bytes.len()
        );
        let mut buf = [0; VERSIONED_FINGERPRINT_SIZE];
        buf.copy_from_slice(bytes);
        VersionedFingerprint(buf)
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::new();
        for byte in &self.0 {
            std::fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }
}

impl AsRef<[u8]> for VersionedFingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
struct ShardId(u8);

#[derive(Debug)]
struct Shard {
    dir: PathBuf,
    env: Arc<Environment>,
    content: Database,
    leases: Database,
}

#[derive(Debug, Clone)]
pub struct ShardedLmdb {
    shards: Arc<HashMap<ShardId, Shard>>,
    executor: pool::Executor,
    lease_time: Duration,
    shard_fingerprint_mask: u8,
}

impl ShardedLmdb {
    /// Bump whenever the byte format of stored data changes.
    pub const SCHEMA_VERSION: u8 = 1;

    ///
    /// `max_size` bounds the combined mapped size of all shards: LMDB maps that much virtual
    /// (not resident) memory up front.
    ///
    pub fn new(
        root_path: PathBuf,
        max_size: usize,
        executor: pool::Executor,
        lease_time: Duration,
        shard_count: u8,
    ) -> Result<ShardedLmdb, String> {
        if shard_count.count_ones() != 1 {
            return Err(format!(
                "The shard_count must be a power of two: got {shard_count}."
            ));
        }

        let max_size_per_shard = max_size / (shard_count as usize);
        // The shard is selected by masking the relevant number of high order bits from the
        // high order byte of each stored key.
        let shard_shift = Self::shard_shift(shard_count);
        let shard_fingerprint_mask = {
            let mask_width = shard_count.trailing_zeros();
            let mut mask = 0_u8;
            for _ in 0..mask_width {
                mask <<= 1;
                mask |= 1;
            }
            mask.rotate_left(shard_shift as u32)
        };

        trace!("Initializing ShardedLmdb at root {root_path:?}");
        let mut shards = HashMap::new();
        for b in 0..shard_count {
            let dir = root_path.join(format!("{b:x}"));
            std::fs::create_dir_all(&dir)
                .map_err(|err| format!("Error making directory for store at {dir:?}: {err:?}"))?;
            let env = Self::make_env(&dir, max_size_per_shard)?;
            let content = env
                .create_db(Some("content-versioned"), DatabaseFlags::empty())
                .map_err(|e| format!("Error creating/opening content database at {dir:?}: {e}"))?;
            let leases = env
                .create_db(Some("leases-versioned"), DatabaseFlags::empty())
                .map_err(|e| format!("Error creating/opening lease database at {dir:?}: {e}"))?;
            shards.insert(
                ShardId(b.rotate_left(shard_shift as u32)),
                Shard {
                    dir,
                    env: Arc::new(env),
                    content,
                    leases,
                },
            );
        }

        Ok(ShardedLmdb {
            shards: Arc::new(shards),
            executor,
            lease_time,
            shard_fingerprint_mask,
        })
    }

    ///
    /// The left shift that places the shard-relevant portion of a byte into its high order
    /// bits, for the given (power of two) shard count.
    ///
    fn shard_shift(shard_count: u8) -> u8 {
        8 - shard_count.trailing_zeros() as u8
    }

    fn make_env(dir: &Path, max_size_per_shard: usize) -> Result<Environment, String> {
        Environment::new()
            // NO_SYNC: don't force an fsync on every write transaction. This is a write-once
            // content-addressed store, so a system crash can at worst roll back recent
            // writes; it cannot corrupt committed content on filesystems which preserve
            // write order.
            //
            // NO_TLS: read transactions otherwise consume a slot in the (default 126 entry)
            // reader table until their *thread* dies; our reads run on a long-lived blocking
            // pool, so slots must be released when the transaction drops instead.
            .set_flags(EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_TLS)
            // One database for content, one for leases.
            .set_max_dbs(2)
            .set_map_size(max_size_per_shard)
            .open(dir)
            .map_err(|e| format!("Error making env for store at {dir:?}: {e}"))
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Shard {
        &self.shards[&ShardId(fingerprint.0[0] & self.shard_fingerprint_mask)]
    }

    pub fn shard_dirs(&self) -> Vec<PathBuf> {
        self.shards.values().map(|shard| shard.dir.clone()).collect()
    }

    pub async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, String> {
        let store = self.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let effective_key =
                        VersionedFingerprint::new(fingerprint, ShardedLmdb::SCHEMA_VERSION);
                    let shard = store.shard(&fingerprint);
                    let del_res = shard.env.begin_rw_txn().and_then(|mut txn| {
                        txn.del(shard.content, &effective_key, None)?;
                        txn.del(shard.leases, &effective_key, None)
                            .or_else(|err| match err {
                                lmdb::Error::NotFound => Ok(()),
                                err => Err(err),
                            })?;
                        txn.commit()
                    });

                    match del_res {
                        Ok(()) => Ok(true),
                        Err(lmdb::Error::NotFound) => Ok(false),
                        Err(err) => Err(format!(
                            "Error removing versioned key {:?}: {}",
                            effective_key.to_hex(),
                            err
                        )),
                    }
                },
                |e| Err(format!("`remove` task failed: {e}")),
            )
            .await
    }

    ///
    /// Singular form of `Self::exists_batch`.
    ///
    pub async fn exists(&self, fingerprint: Fingerprint) -> Result<bool, String> {
        let existing = self.exists_batch(vec![fingerprint]).await?;
        Ok(existing.contains(&fingerprint))
    }

    ///
    /// Returns the subset of the given fingerprints which are present in the store.
    ///
    pub async fn exists_batch(
        &self,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<HashSet<Fingerprint>, String> {
        let store = self.clone();
        self.executor
            .spawn_blocking(
                move || {
                    // Group by the shard each fingerprint lives in, and then open one read
                    // transaction per shard.
                    let mut keys_by_shard: HashMap<u8, Vec<VersionedFingerprint>> = HashMap::new();
                    for fingerprint in &fingerprints {
                        keys_by_shard
                            .entry(fingerprint.0[0] & store.shard_fingerprint_mask)
                            .or_default()
                            .push(VersionedFingerprint::new(
                                *fingerprint,
                                ShardedLmdb::SCHEMA_VERSION,
                            ));
                    }

                    let mut exists = HashSet::new();
                    for (shard_id, keys) in keys_by_shard {
                        let shard = &store.shards[&ShardId(shard_id)];
                        shard
                            .env
                            .begin_ro_txn()
                            .and_then(|txn| {
                                for key in &keys {
                                    match txn.get(shard.content, &key) {
                                        Ok(_) => {
                                            exists.insert(key.get_fingerprint());
                                        }
                                        Err(lmdb::Error::NotFound) => (),
                                        Err(err) => return Err(err),
                                    }
                                }
                                Ok(())
                            })
                            .map_err(|e| format!("Error checking existence: {e}"))?;
                    }
                    Ok(exists)
                },
                |e| Err(format!("`exists_batch` task failed: {e}")),
            )
            .await
    }

    ///
    /// Returns all stored fingerprints with their lease ages and sizes, for GC.
    ///
    pub async fn all_fingerprints(&self) -> Result<Vec<AgedFingerprint>, String> {
        let store = self.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let mut fingerprints = Vec::new();
                    for shard in store.shards.values() {
                        let txn = shard.env.begin_ro_txn().map_err(|err| {
                            format!("Error beginning transaction to garbage collect: {err}")
                        })?;
                        let mut cursor = txn
                            .open_ro_cursor(shard.content)
                            .map_err(|err| format!("Failed to open lmdb read cursor: {err}"))?;
                        for key_res in cursor.iter() {
                            let (key, bytes) = key_res.map_err(|err| {
                                format!("Failed to advance lmdb read cursor: {err}")
                            })?;

                            // Point lookups into the lease database are slower than a merged
                            // iteration would be, but GC is rare enough for one pass to win
                            // on simplicity.
                            let leased_until_unix_secs = txn
                                .get(shard.leases, &key)
                                .map(|b| {
                                    let mut array = [0_u8; 8];
                                    array.copy_from_slice(b);
                                    u64::from_le_bytes(array)
                                })
                                .unwrap_or_else(|e| match e {
                                    lmdb::Error::NotFound => 0,
                                    e => panic!(
                                        "Error reading lease, probable lmdb corruption: {e:?}"
                                    ),
                                });

                            let leased_until =
                                time::UNIX_EPOCH + Duration::from_secs(leased_until_unix_secs);
                            let expired_seconds_ago = time::SystemTime::now()
                                .duration_since(leased_until)
                                .map(|t| t.as_secs())
                                // 0 indicates unexpired.
                                .unwrap_or(0);

                            fingerprints.push(AgedFingerprint {
                                expired_seconds_ago,
                                fingerprint: VersionedFingerprint::from_bytes_unsafe(key)
                                    .get_fingerprint(),
                                size_bytes: bytes.len() as u64,
                            });
                        }
                    }
                    Ok(fingerprints)
                },
                |e| Err(format!("`all_fingerprints` task failed: {e}")),
            )
            .await
    }

    ///
    /// Singular form of `Self::store_bytes_batch`.
    ///
    pub async fn store_bytes(
        &self,
        fingerprint: Fingerprint,
        bytes: Bytes,
        initial_lease: bool,
    ) -> Result<Fingerprint, String> {
        self.store_bytes_batch(vec![(fingerprint, bytes)], initial_lease)
            .await?;
        Ok(fingerprint)
    }

    ///
    /// Stores the given Bytes under the given Fingerprints. For large or streaming content,
    /// prefer `Self::store`.
    ///
    pub async fn store_bytes_batch(
        &self,
        items: Vec<(Fingerprint, Bytes)>,
        initial_lease: bool,
    ) -> Result<(), String> {
        let store = self.clone();
        self.executor
            .spawn_blocking(
                move || {
                    // Group by shard, then open and commit one write transaction per shard.
                    // At most one transaction is open at a time, so ordering is not a
                    // concern.
                    let mut items_by_shard: HashMap<u8, Vec<(VersionedFingerprint, Bytes)>> =
                        HashMap::new();
                    for (fingerprint, bytes) in items {
                        items_by_shard
                            .entry(fingerprint.0[0] & store.shard_fingerprint_mask)
                            .or_default()
                            .push((
                                VersionedFingerprint::new(
                                    fingerprint,
                                    ShardedLmdb::SCHEMA_VERSION,
                                ),
                                bytes,
                            ));
                    }

                    for (shard_id, batch) in items_by_shard {
                        let shard = &store.shards[&ShardId(shard_id)];
                        shard
                            .env
                            .begin_rw_txn()
                            .and_then(|mut txn| {
                                for (effective_key, bytes) in &batch {
                                    let put_res = txn.put(
                                        shard.content,
                                        &effective_key,
                                        bytes,
                                        WriteFlags::NO_OVERWRITE,
                                    );
                                    match put_res {
                                        Ok(()) => (),
                                        // Concurrent writers of identical content converge.
                                        Err(lmdb::Error::KeyExist) => continue,
                                        Err(err) => return Err(err),
                                    }
                                    if initial_lease {
                                        store.lease_inner(
                                            shard.leases,
                                            effective_key,
                                            store.lease_until_secs_since_epoch(),
                                            &mut txn,
                                        )?;
                                    }
                                }
                                txn.commit()
                            })
                            .map_err(|e| {
                                format!(
                                    "Error storing fingerprints {:?}: {}",
                                    batch.iter().map(|(key, _)| key.to_hex()).collect::<Vec<_>>(),
                                    e
                                )
                            })?;
                    }

                    Ok(())
                },
                |e| Err(format!("`store_bytes_batch` task failed: {e}")),
            )
            .await
    }

    ///
    /// Stores the content of the given reader under its expected digest without buffering it
    /// all into memory. When `data_is_immutable` is false, the content is re-hashed during
    /// the copy, and the write retries if the source changed underneath us.
    ///
    pub async fn store<F, R>(
        &self,
        initial_lease: bool,
        data_is_immutable: bool,
        expected_digest: Digest,
        data_provider: F,
    ) -> Result<(), String>
    where
        R: Read + Debug,
        F: Fn() -> Result<R, io::Error> + Send + 'static,
    {
        let store = self.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let mut attempts = 0;
                    loop {
                        let effective_key = VersionedFingerprint::new(
                            expected_digest.hash,
                            ShardedLmdb::SCHEMA_VERSION,
                        );
                        let shard = store.shard(&expected_digest.hash);
                        let put_res: Result<(), WriteError> = shard
                            .env
                            .begin_rw_txn()
                            .map_err(WriteError::Lmdb)
                            .and_then(|mut txn| {
                                // Reserve the exact destination size in the map, and copy
                                // (re-hashing as we go) directly into it.
                                let buf = txn.reserve(
                                    shard.content,
                                    &effective_key,
                                    expected_digest.size_bytes as usize,
                                    WriteFlags::NO_OVERWRITE,
                                )?;
                                let mut writer: &mut [u8] = buf;
                                let mut read = data_provider()
                                    .map_err(|e| format!("Failed to read: {e}"))?;
                                let matched = sync_verified_copy(
                                    expected_digest,
                                    data_is_immutable,
                                    &mut read,
                                    &mut writer,
                                )
                                .map_err(|e| {
                                    format!("Failed to copy from {read:?} into the store: {e:?}")
                                })?;

                                if !matched {
                                    let msg = format!("Input {read:?} changed while reading.");
                                    log::debug!("{msg}");
                                    return Err(WriteError::Retry(msg));
                                }

                                if initial_lease {
                                    store.lease_inner(
                                        shard.leases,
                                        &effective_key,
                                        store.lease_until_secs_since_epoch(),
                                        &mut txn,
                                    )?;
                                }
                                txn.commit()?;
                                Ok(())
                            });

                        match put_res {
                            Ok(()) => return Ok(()),
                            Err(WriteError::Retry(msg)) => {
                                // The input changed while we were reading it.
                                if attempts > 10 {
                                    return Err(msg);
                                }
                                attempts += 1;
                            }
                            Err(WriteError::Lmdb(lmdb::Error::KeyExist)) => return Ok(()),
                            Err(WriteError::Lmdb(err)) => {
                                return Err(format!("Error storing {expected_digest:?}: {err}"));
                            }
                            Err(WriteError::Io(err)) => {
                                return Err(format!("Error storing {expected_digest:?}: {err}"));
                            }
                        }
                    }
                },
                |e| Err(format!("`store` task failed: {e}")),
            )
            .await
    }

    /// Extends the lease of the given fingerprint by the configured lease time.
    pub async fn lease(&self, fingerprint: Fingerprint) -> Result<(), String> {
        let store = self.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let until_secs_since_epoch = store.lease_until_secs_since_epoch();
                    let shard = store.shard(&fingerprint);
                    shard
                        .env
                        .begin_rw_txn()
                        .and_then(|mut txn| {
                            store.lease_inner(
                                shard.leases,
                                &VersionedFingerprint::new(
                                    fingerprint,
                                    ShardedLmdb::SCHEMA_VERSION,
                                ),
                                until_secs_since_epoch,
                                &mut txn,
                            )?;
                            txn.commit()
                        })
                        .map_err(|e| format!("Error leasing {fingerprint:?}: {e}"))
                },
                |e| Err(format!("`lease` task failed: {e}")),
            )
            .await
    }

    fn lease_inner(
        &self,
        database: Database,
        versioned_fingerprint: &VersionedFingerprint,
        until_secs_since_epoch: u64,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), lmdb::Error> {
        txn.put(
            database,
            &versioned_fingerprint.as_ref(),
            &until_secs_since_epoch.to_le_bytes(),
            WriteFlags::empty(),
        )
    }

    fn lease_until_secs_since_epoch(&self) -> u64 {
        let now_since_epoch = time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .expect("Surely you're not before the unix epoch?");
        (now_since_epoch + self.lease_time).as_secs()
    }

    ///
    /// Loads the stored bytes for the given fingerprint, exposing them to the given function
    /// as a slice directly into the store's shared memory map.
    ///
    pub async fn load_bytes_with<
        T: Send + 'static,
        F: FnMut(&[u8]) -> Result<T, String> + Send + Sync + 'static,
    >(
        &self,
        fingerprint: Fingerprint,
        mut f: F,
    ) -> Result<Option<T>, String> {
        let store = self.clone();
        let effective_key = VersionedFingerprint::new(fingerprint, ShardedLmdb::SCHEMA_VERSION);
        self.executor
            .spawn_blocking(
                move || {
                    let shard = store.shard(&fingerprint);
                    let ro_txn = shard
                        .env
                        .begin_ro_txn()
                        .map_err(|err| format!("Failed to begin read transaction: {err}"))?;
                    match ro_txn.get(shard.content, &effective_key) {
                        Ok(bytes) => f(bytes).map(Some),
                        Err(lmdb::Error::NotFound) => Ok(None),
                        Err(err) => Err(format!(
                            "Error loading versioned key {:?}: {}",
                            effective_key.to_hex(),
                            err,
                        )),
                    }
                },
                |e| Err(format!("`load_bytes_with` task failed: {e}")),
            )
            .await
    }
}

enum WriteError {
    Lmdb(lmdb::Error),
    Io(String),
    Retry(String),
}

impl From<lmdb::Error> for WriteError {
    fn from(err: lmdb::Error) -> Self {
        Self::Lmdb(err)
    }
}

impl From<String> for WriteError {
    fn from(err: String) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests;
