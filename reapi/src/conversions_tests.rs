// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::gen::build::bazel::remote::execution::v2 as remexec;
use crate::require_digest;

#[test]
fn digest_round_trip() {
    let digest = fingerprint::Digest::of_bytes(b"hello");
    let proto: remexec::Digest = digest.into();
    assert_eq!(proto.hash, digest.hash.to_hex());
    assert_eq!(proto.size_bytes, 5);
    assert_eq!(fingerprint::Digest::try_from(&proto).unwrap(), digest);
}

#[test]
fn bad_fingerprint_is_rejected() {
    let proto = remexec::Digest {
        hash: "not-hex".to_owned(),
        size_bytes: 0,
    };
    assert!(fingerprint::Digest::try_from(&proto).is_err());
}

#[test]
fn require_digest_errors_on_missing() {
    assert!(require_digest(&None).is_err());
    let digest = fingerprint::Digest::of_bytes(b"hello");
    assert_eq!(require_digest(&Some(digest.into())).unwrap(), digest);
}

#[test]
fn empty_digest_matches_constant() {
    let empty = remexec::empty_digest();
    assert_eq!(
        fingerprint::Digest::try_from(&empty).unwrap(),
        fingerprint::EMPTY_DIGEST
    );
}
