// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io;
use std::time::Duration;

use bytes::Bytes;
use fingerprint::Digest;
use tempfile::TempDir;

use crate::{DEFAULT_LEASE_TIME, ShardedLmdb};

fn new_store(dir: &TempDir, shard_count: u8) -> ShardedLmdb {
    ShardedLmdb::new(
        dir.path().to_owned(),
        16 * 1024 * 1024,
        pool::Executor::new(),
        DEFAULT_LEASE_TIME,
        shard_count,
    )
    .unwrap()
}

#[tokio::test]
async fn roundtrip_bytes() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, 4);

    let digest = Digest::of_bytes(b"hello");
    store
        .store_bytes(digest.hash, Bytes::from_static(b"hello"), false)
        .await
        .unwrap();

    assert!(store.exists(digest.hash).await.unwrap());
    let loaded = store
        .load_bytes_with(digest.hash, |bytes| Ok(Bytes::copy_from_slice(bytes)))
        .await
        .unwrap();
    assert_eq!(loaded, Some(Bytes::from_static(b"hello")));
}

#[tokio::test]
async fn missing_fingerprint_loads_none() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, 4);
    let digest = Digest::of_bytes(b"never stored");
    let loaded = store
        .load_bytes_with(digest.hash, |bytes| Ok(bytes.len()))
        .await
        .unwrap();
    assert_eq!(loaded, None);
}

#[tokio::test]
async fn shard_count_must_be_a_power_of_two() {
    let dir = TempDir::new().unwrap();
    let err = ShardedLmdb::new(
        dir.path().to_owned(),
        16 * 1024 * 1024,
        pool::Executor::new(),
        DEFAULT_LEASE_TIME,
        3,
    )
    .unwrap_err();
    assert!(err.contains("power of two"), "was: {err}");
}

#[tokio::test]
async fn store_streams_and_verifies() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, 4);

    let content: Vec<u8> = (0..1024_u32).flat_map(|i| i.to_le_bytes()).collect();
    let digest = Digest::of_bytes(&content);
    let content2 = content.clone();
    store
        .store(false, false, digest, move || {
            Ok(io::Cursor::new(content2.clone()))
        })
        .await
        .unwrap();

    let loaded = store
        .load_bytes_with(digest.hash, |bytes| Ok(bytes.to_vec()))
        .await
        .unwrap();
    assert_eq!(loaded, Some(content));
}

#[tokio::test]
async fn store_rejects_changing_content() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, 4);

    // A provider which never produces the expected content.
    let digest = Digest::new(Digest::of_bytes(b"expected").hash, 8);
    let err = store
        .store(false, false, digest, move || {
            Ok(io::Cursor::new(b"mismatch".to_vec()))
        })
        .await
        .unwrap_err();
    assert!(err.contains("changed while reading"), "was: {err}");
}

#[tokio::test]
async fn identical_concurrent_writes_converge() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, 4);
    let digest = Digest::of_bytes(b"racy");

    let writes = (0..16).map(|_| {
        let store = store.clone();
        async move {
            store
                .store_bytes(digest.hash, Bytes::from_static(b"racy"), false)
                .await
        }
    });
    for result in futures_join_all(writes).await {
        result.unwrap();
    }

    let loaded = store
        .load_bytes_with(digest.hash, |bytes| Ok(Bytes::copy_from_slice(bytes)))
        .await
        .unwrap();
    assert_eq!(loaded, Some(Bytes::from_static(b"racy")));
}

async fn futures_join_all<I>(futures: I) -> Vec<<I::Item as std::future::Future>::Output>
where
    I: IntoIterator,
    I::Item: std::future::Future,
{
    let mut results = Vec::new();
    for future in futures {
        results.push(future.await);
    }
    results
}

#[tokio::test]
async fn remove_deletes_content() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, 2);
    let digest = Digest::of_bytes(b"to-remove");

    store
        .store_bytes(digest.hash, Bytes::from_static(b"to-remove"), false)
        .await
        .unwrap();
    assert!(store.remove(digest.hash).await.unwrap());
    assert!(!store.remove(digest.hash).await.unwrap());
    assert!(!store.exists(digest.hash).await.unwrap());
}

#[tokio::test]
async fn leases_shield_entries_from_expiry() {
    let dir = TempDir::new().unwrap();
    let store = ShardedLmdb::new(
        dir.path().to_owned(),
        16 * 1024 * 1024,
        pool::Executor::new(),
        Duration::from_secs(2 * 60 * 60),
        2,
    )
    .unwrap();

    let unleased = Digest::of_bytes(b"unleased");
    let leased = Digest::of_bytes(b"leased");
    store
        .store_bytes(unleased.hash, Bytes::from_static(b"unleased"), false)
        .await
        .unwrap();
    store
        .store_bytes(leased.hash, Bytes::from_static(b"leased"), true)
        .await
        .unwrap();

    let aged = store.all_fingerprints().await.unwrap();
    assert_eq!(aged.len(), 2);
    for af in aged {
        if af.fingerprint == leased.hash {
            assert_eq!(af.expired_seconds_ago, 0, "leased entry should be unexpired");
        } else {
            // Never leased: its lease expired at the epoch.
            assert!(af.expired_seconds_ago > 0, "unleased entry should be expired");
        }
    }
}
