// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Wire types and clients for the remote execution API (REAPI) and its companion services
//! (bytestream, longrunning operations).
//!
//! The message structs carry hand-written `prost` derives whose field tags match the public
//! protos bit-for-bit, so serialised messages are interchangeable with any other REAPI
//! implementation, and the build does not require a system `protoc`.

// See https://github.com/hyperium/tonic/issues/1056
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod gen;

mod client;
pub use client::{
    ActionCacheClient, ByteStreamClient, ContentAddressableStorageClient, ExecutionClient,
};

mod conversions;
pub use conversions::require_digest;

mod ext;
pub use ext::MessageExt;

mod verification;
pub use verification::verify_directory_canonical;

#[cfg(test)]
mod conversions_tests;
#[cfg(test)]
mod verification_tests;
