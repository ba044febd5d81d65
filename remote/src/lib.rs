// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Provider traits for remote byte stores and action caches, plus their REAPI
//! implementations. The traits are the seam at which alternate backends would plug in.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fingerprint::Digest;
use reapi::gen::build::bazel::remote::execution::v2::ActionResult;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite};

mod reapi_provider;
pub use reapi_provider::{ReapiActionCacheProvider, ReapiByteStoreProvider};

/// Connection parameters for a remote store or cache.
#[derive(Clone)]
pub struct RemoteStoreOptions {
    pub store_address: String,
    pub instance_name: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub tls_config: rpc::tls::Config,
    pub chunk_size_bytes: usize,
    pub timeout: Duration,
    pub retries: usize,
    pub concurrency_limit: usize,
    pub batch_api_size_limit: usize,
}

impl Default for RemoteStoreOptions {
    fn default() -> Self {
        RemoteStoreOptions {
            store_address: String::new(),
            instance_name: None,
            headers: BTreeMap::new(),
            tls_config: rpc::tls::Config::default(),
            chunk_size_bytes: 64 * 1024,
            timeout: Duration::from_secs(30),
            retries: 3,
            concurrency_limit: 16,
            batch_api_size_limit: 4 * 1024 * 1024,
        }
    }
}

#[async_trait]
pub trait ByteStoreProvider: Sync + Send + 'static {
    /// Stores the bytes readable from `file` into the remote store.
    async fn store_file(&self, digest: Digest, file: File) -> Result<(), String>;

    /// Stores in-memory bytes into the remote store.
    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String>;

    /// Loads the data stored (if any) for `digest` into `destination`. Returns true when
    /// found, false when not.
    async fn load(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<bool, String>;

    /// Returns any digests from `digests` that are not currently available in the remote
    /// store.
    async fn list_missing_digests(
        &self,
        digests: &mut (dyn Iterator<Item = Digest> + Send),
    ) -> Result<HashSet<Digest>, String>;
}

/// Places that a remote `load` writes into.
#[async_trait]
pub trait LoadDestination: AsyncWrite + Send + Sync + Unpin + 'static {
    /// Clears the destination and starts again, discarding any previously written content.
    async fn reset(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl LoadDestination for File {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.rewind().await?;
        self.set_len(0).await
    }
}

#[async_trait]
impl LoadDestination for Vec<u8> {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.clear();
        Ok(())
    }
}

/// The operations required to cache command executions remotely.
#[async_trait]
pub trait ActionCacheProvider: Sync + Send + 'static {
    async fn update_action_result(
        &self,
        action_digest: Digest,
        action_result: ActionResult,
    ) -> Result<(), String>;

    async fn get_action_result(
        &self,
        action_digest: Digest,
        build_id: &str,
    ) -> Result<Option<ActionResult>, String>;
}
