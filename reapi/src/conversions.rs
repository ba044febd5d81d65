// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::gen::build::bazel::remote::execution::v2 as remexec;

impl From<&fingerprint::Digest> for remexec::Digest {
    fn from(d: &fingerprint::Digest) -> Self {
        remexec::Digest {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl From<fingerprint::Digest> for remexec::Digest {
    fn from(d: fingerprint::Digest) -> Self {
        (&d).into()
    }
}

impl TryFrom<&remexec::Digest> for fingerprint::Digest {
    type Error = String;

    fn try_from(d: &remexec::Digest) -> Result<Self, Self::Error> {
        fingerprint::Fingerprint::from_hex_string(&d.hash)
            .map_err(|err| format!("Bad fingerprint in Digest {:?}: {:?}", d.hash, err))
            .map(|fingerprint| fingerprint::Digest::new(fingerprint, d.size_bytes as u64))
    }
}

impl TryFrom<remexec::Digest> for fingerprint::Digest {
    type Error = String;

    fn try_from(d: remexec::Digest) -> Result<Self, Self::Error> {
        (&d).try_into()
    }
}

/// Extracts a required `Digest` field from a message, erroring if it is unset or malformed.
pub fn require_digest(
    digest_opt: &Option<remexec::Digest>,
) -> Result<fingerprint::Digest, String> {
    match digest_opt {
        Some(digest) => fingerprint::Digest::try_from(digest),
        None => Err("Protocol violation: Digest missing from a Remote Execution API protobuf."
            .to_owned()),
    }
}
