// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;
use tempfile::TempDir;
use testutil::{TestData, TestDirectory};

use crate::local::ByteStore;
use crate::{EntryType, LocalOptions};

fn new_byte_store(dir: &TempDir) -> ByteStore {
    ByteStore::new_with_options(
        pool::Executor::new(),
        dir.path(),
        LocalOptions {
            files_max_size_bytes: 16 * 1024 * 1024,
            directories_max_size_bytes: 16 * 1024 * 1024,
            ..LocalOptions::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn small_file_roundtrips_through_lmdb() {
    let dir = TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::roland();

    store
        .store_bytes(EntryType::File, testdata.digest().hash, testdata.bytes(), false)
        .await
        .unwrap();

    // Small blobs do not hit the fanout pool.
    assert_eq!(store.load_from_fs(testdata.digest()).await.unwrap(), None);
    let loaded = store
        .load_bytes_with(EntryType::File, testdata.digest(), |bytes| {
            Bytes::copy_from_slice(bytes)
        })
        .await
        .unwrap();
    assert_eq!(loaded, Some(testdata.bytes()));
}

#[tokio::test]
async fn large_file_lands_in_fanout_pool() {
    let dir = TempDir::new().unwrap();
    let store = new_byte_store(&dir);

    let content = Bytes::from(vec![0xaa_u8; crate::local::LARGE_FILE_SIZE_LIMIT + 1]);
    let digest = fingerprint::Digest::of_bytes(&content);
    store
        .store_bytes(EntryType::File, digest.hash, content.clone(), false)
        .await
        .unwrap();

    let fs_path = store.load_from_fs(digest).await.unwrap().expect("in pool");
    assert!(fs_path.starts_with(dir.path().join("immutable").join("files")));
    // The fanout is two hex characters deep.
    assert_eq!(
        fs_path.parent().unwrap().file_name().unwrap().to_str().unwrap(),
        &digest.hash.to_hex()[0..2],
    );

    let loaded = store
        .load_bytes_with(EntryType::File, digest, |bytes| Bytes::copy_from_slice(bytes))
        .await
        .unwrap();
    assert_eq!(loaded, Some(content));
}

#[tokio::test]
async fn directories_and_files_are_separate_namespaces() {
    let dir = TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdir = TestDirectory::containing_roland();

    store
        .store_bytes(
            EntryType::Directory,
            testdir.digest().hash,
            testdir.bytes(),
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        store
            .load_bytes_with(EntryType::File, testdir.digest(), |b| b.len())
            .await
            .unwrap(),
        None,
    );
    assert_eq!(
        store.entry_type(testdir.digest().hash).await.unwrap(),
        Some(EntryType::Directory),
    );
}

#[tokio::test]
async fn length_mismatch_is_reported_as_corruption() {
    let dir = TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::roland();

    // Store bytes under a fingerprint whose claimed length is wrong.
    let mut bad_digest = testdata.digest();
    bad_digest.size_bytes += 1;
    store
        .store_bytes(EntryType::File, bad_digest.hash, testdata.bytes(), false)
        .await
        .unwrap();

    let err = store
        .load_bytes_with(EntryType::File, bad_digest, |b| b.len())
        .await
        .unwrap_err();
    assert!(err.contains("hash collision"), "was: {err}");
}

#[tokio::test]
async fn missing_digests_are_reported() {
    let dir = TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let present = TestData::roland();
    let missing = TestData::catnip();

    store
        .store_bytes(EntryType::File, present.digest().hash, present.bytes(), false)
        .await
        .unwrap();

    let missing_digests = store
        .get_missing_digests(
            EntryType::File,
            vec![present.digest(), missing.digest(), fingerprint::EMPTY_DIGEST]
                .into_iter()
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(
        missing_digests,
        vec![missing.digest()].into_iter().collect()
    );
}

#[tokio::test]
async fn store_file_from_disk_computes_digest() {
    let dir = TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::roland();

    let src = dir.path().join("src-file");
    std::fs::write(&src, testdata.string()).unwrap();
    let digest = store
        .store(EntryType::File, false, false, src)
        .await
        .unwrap();
    assert_eq!(digest, testdata.digest());
}
