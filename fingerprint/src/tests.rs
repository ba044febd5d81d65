// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_test::{Token, assert_ser_tokens};

use crate::{Digest, EMPTY_DIGEST, Fingerprint, async_verified_copy, sync_verified_copy};

fn hello_fingerprint() -> Fingerprint {
    // SHA-256 of b"hello".
    Fingerprint::from_hex_string(
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
    )
    .unwrap()
}

#[test]
fn empty_digest_matches_hash_of_nothing() {
    assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
}

#[test]
fn hex_round_trip() {
    let hex = "0123456789abcdef000000000000000000000000000000000000000000000000";
    let fingerprint = Fingerprint::from_hex_string(hex).unwrap();
    assert_eq!(fingerprint.to_hex(), hex);
    assert_eq!(format!("{fingerprint}"), hex);
    assert_eq!(format!("{fingerprint:?}"), format!("Fingerprint<{hex}>"));
}

#[test]
fn from_hex_string_rejects_bad_input() {
    assert!(Fingerprint::from_hex_string("abc").is_err());
    assert!(
        Fingerprint::from_hex_string(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
        )
        .is_err()
    );
}

#[test]
fn of_bytes_hashes_content() {
    let digest = Digest::of_bytes(b"hello");
    assert_eq!(digest.hash, hello_fingerprint());
    assert_eq!(digest.size_bytes, 5);
}

#[test]
fn digest_serializes_with_hex_fingerprint() {
    let digest = Digest::new(hello_fingerprint(), 5);
    assert_ser_tokens(
        &digest,
        &[
            Token::Struct {
                name: "Digest",
                len: 2,
            },
            Token::Str("fingerprint"),
            Token::Str("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
            Token::Str("size_bytes"),
            Token::U64(5),
            Token::StructEnd,
        ],
    );
}

#[test]
fn sync_verified_copy_checks_content() {
    let digest = Digest::of_bytes(b"hello");

    let mut out = Vec::new();
    assert!(sync_verified_copy(digest, false, &mut &b"hello"[..], &mut out).unwrap());
    assert_eq!(out, b"hello");

    let mut out = Vec::new();
    assert!(!sync_verified_copy(digest, false, &mut &b"goodbye"[..], &mut out).unwrap());
}

#[test]
fn sync_verified_copy_trusts_immutable_sources() {
    let digest = Digest::of_bytes(b"hello");

    // An immutable source is only length checked.
    let mut out = Vec::new();
    assert!(sync_verified_copy(digest, true, &mut &b"olleh"[..], &mut out).unwrap());

    let mut out = Vec::new();
    assert!(!sync_verified_copy(digest, true, &mut &b"too long"[..], &mut out).unwrap());
}

#[tokio::test]
async fn async_verified_copy_checks_content() {
    let digest = Digest::of_bytes(b"hello");

    let mut out = Vec::new();
    assert!(
        async_verified_copy(digest, false, &mut &b"hello"[..], &mut out)
            .await
            .unwrap()
    );
    assert_eq!(out, b"hello");

    let mut out = Vec::new();
    assert!(
        !async_verified_copy(digest, false, &mut &b"goodbye"[..], &mut out)
            .await
            .unwrap()
    );
}

#[test]
fn aged_fingerprints_sort_most_expired_first() {
    let newer = crate::AgedFingerprint {
        expired_seconds_ago: 10,
        fingerprint: hello_fingerprint(),
        size_bytes: 5,
    };
    let older = crate::AgedFingerprint {
        expired_seconds_ago: 100,
        ..newer
    };
    let mut heap = std::collections::BinaryHeap::new();
    heap.push(newer);
    heap.push(older);
    assert_eq!(heap.pop().unwrap().expired_seconds_ago, 100);
}
