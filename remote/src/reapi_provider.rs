// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use fingerprint::Digest;
use futures::StreamExt;
use log::debug;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;
use reapi::gen::google::bytestream;
use reapi::{ActionCacheClient, ByteStreamClient, ContentAddressableStorageClient};
use rpc::retry::{retry_call, status_is_retryable};
use rpc::{LayeredService, status_to_str};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::{ActionCacheProvider, LoadDestination, RemoteStoreOptions};

pub struct ReapiByteStoreProvider {
    instance_name: Option<String>,
    chunk_size_bytes: usize,
    batch_api_size_limit: usize,
    concurrency_limit: Semaphore,
    cas_client: ContentAddressableStorageClient<LayeredService>,
    byte_stream_client: ByteStreamClient<LayeredService>,
}

impl fmt::Debug for ReapiByteStoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReapiByteStoreProvider")
            .field("instance_name", &self.instance_name)
            .finish_non_exhaustive()
    }
}

impl ReapiByteStoreProvider {
    pub async fn new(options: RemoteStoreOptions) -> Result<ReapiByteStoreProvider, String> {
        let channel =
            rpc::create_channel(&options.store_address, Some(&options.tls_config)).await?;
        let service = rpc::layered_service(channel, &options.headers)?;

        Ok(ReapiByteStoreProvider {
            instance_name: options.instance_name,
            chunk_size_bytes: options.chunk_size_bytes,
            batch_api_size_limit: options.batch_api_size_limit,
            concurrency_limit: Semaphore::new(options.concurrency_limit),
            cas_client: ContentAddressableStorageClient::new(service.clone()),
            byte_stream_client: ByteStreamClient::new(service),
        })
    }

    fn instance_name_prefix(&self) -> String {
        self.instance_name
            .as_ref()
            .map(|name| format!("{name}/"))
            .unwrap_or_default()
    }

    async fn store_bytes_batch(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let request = remexec::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            requests: vec![remexec::batch_update_blobs_request::Request {
                digest: Some(digest.into()),
                data: bytes,
            }],
        };

        let response = retry_call(
            self.cas_client.clone(),
            move |mut client, _| {
                let request = request.clone();
                async move { client.batch_update_blobs(request).await }
            },
            status_is_retryable,
        )
        .await
        .map_err(|err| status_to_str(&err))?
        .into_inner();

        for response in response.responses {
            if let Some(status) = response.status {
                if status.code != 0 {
                    return Err(format!(
                        "Failed to store {digest:?} remotely: {} {}",
                        status.code, status.message
                    ));
                }
            }
        }
        Ok(())
    }

    async fn load_once(
        &self,
        resource_name: &str,
        destination: &mut dyn LoadDestination,
    ) -> Result<(), tonic::Status> {
        let mut client = self.byte_stream_client.clone();
        let mut stream = client
            .read(bytestream::ReadRequest {
                resource_name: resource_name.to_owned(),
                read_offset: 0,
                read_limit: 0,
            })
            .await?
            .into_inner();

        while let Some(response) = stream.next().await {
            let data = response?.data;
            destination.write_all(&data).await.map_err(|err| {
                tonic::Status::internal(format!("Failed to write to load destination: {err}"))
            })?;
        }
        destination.flush().await.map_err(|err| {
            tonic::Status::internal(format!("Failed to flush load destination: {err}"))
        })
    }

    async fn store_bytes_stream(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let resource_name = format!(
            "{}uploads/{}/blobs/{}/{}",
            self.instance_name_prefix(),
            uuid_for_upload(digest),
            digest.hash.to_hex(),
            digest.size_bytes,
        );
        let chunk_size_bytes = self.chunk_size_bytes;

        retry_call(
            self.byte_stream_client.clone(),
            move |mut client, _| {
                let resource_name = resource_name.clone();
                let bytes = bytes.clone();
                async move {
                    let stream = async_stream::stream! {
                        let total_len = bytes.len();
                        let mut offset = 0_usize;
                        loop {
                            let next_offset = (offset + chunk_size_bytes).min(total_len);
                            yield bytestream::WriteRequest {
                                // Only set on the first request of the stream.
                                resource_name: if offset == 0 {
                                    resource_name.clone()
                                } else {
                                    String::new()
                                },
                                write_offset: offset as i64,
                                finish_write: next_offset == total_len,
                                data: bytes.slice(offset..next_offset),
                            };
                            if next_offset == total_len {
                                break;
                            }
                            offset = next_offset;
                        }
                    };
                    client.write(tonic::Request::new(stream)).await
                }
            },
            status_is_retryable,
        )
        .await
        .map(|response| {
            let committed = response.into_inner().committed_size;
            if committed as u64 != digest.size_bytes {
                debug!(
                    "Remote write for {digest:?} committed {committed} bytes (expected {})",
                    digest.size_bytes
                );
            }
        })
        .map_err(|err| status_to_str(&err))
    }
}

#[async_trait]
impl crate::ByteStoreProvider for ReapiByteStoreProvider {
    async fn store_file(&self, digest: Digest, mut file: tokio::fs::File) -> Result<(), String> {
        // NB: The file is re-read per retry attempt by buffering it first; blobs this large
        // have already been determined to exceed the batch API limit.
        let mut bytes = Vec::with_capacity(digest.size_bytes as usize);
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut bytes)
            .await
            .map_err(|err| format!("Failed to read file for upload: {err}"))?;
        self.store_bytes(digest, Bytes::from(bytes)).await
    }

    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let _permit = self
            .concurrency_limit
            .acquire()
            .await
            .map_err(|e| format!("Failed to acquire permit: {e}"))?;
        if bytes.len() <= self.batch_api_size_limit {
            self.store_bytes_batch(digest, bytes).await
        } else {
            self.store_bytes_stream(digest, bytes).await
        }
    }

    async fn load(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<bool, String> {
        let _permit = self
            .concurrency_limit
            .acquire()
            .await
            .map_err(|e| format!("Failed to acquire permit: {e}"))?;
        let resource_name = format!(
            "{}blobs/{}/{}",
            self.instance_name_prefix(),
            digest.hash.to_hex(),
            digest.size_bytes,
        );

        // `retry_call` cannot thread the unique destination reference through its attempts,
        // so retries are inlined here: each attempt resets the destination first.
        const MAX_RETRIES: u32 = 3;
        let mut attempts = 0;
        loop {
            if attempts > 0 {
                destination
                    .reset()
                    .await
                    .map_err(|err| format!("Failed to reset load destination: {err}"))?;
                tokio::time::sleep(std::time::Duration::from_millis(20 * attempts as u64)).await;
            }

            match self.load_once(&resource_name, destination).await {
                Ok(()) => return Ok(true),
                Err(status) if status.code() == tonic::Code::NotFound => return Ok(false),
                Err(status) if attempts < MAX_RETRIES && status_is_retryable(&status) => {
                    attempts += 1;
                }
                Err(status) => return Err(status_to_str(&status)),
            }
        }
    }

    async fn list_missing_digests(
        &self,
        digests: &mut (dyn Iterator<Item = Digest> + Send),
    ) -> Result<HashSet<Digest>, String> {
        let request = remexec::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            blob_digests: digests.map(|d| d.into()).collect(),
        };

        let _permit = self
            .concurrency_limit
            .acquire()
            .await
            .map_err(|e| format!("Failed to acquire permit: {e}"))?;
        let response = retry_call(
            self.cas_client.clone(),
            move |mut client, _| {
                let request = request.clone();
                async move { client.find_missing_blobs(request).await }
            },
            status_is_retryable,
        )
        .await
        .map_err(|err| status_to_str(&err))?
        .into_inner();

        response
            .missing_blob_digests
            .iter()
            .map(|digest| digest.try_into())
            .collect::<Result<HashSet<_>, _>>()
    }
}

/// Derives a stable upload id from the digest being uploaded. Identical concurrent uploads
/// will share a resource name, which the protocol permits.
fn uuid_for_upload(digest: Digest) -> String {
    let hex = digest.hash.to_hex();
    format!(
        "{}-{}-4{}-8{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        &hex[17..20],
        &hex[20..32]
    )
}

pub struct ReapiActionCacheProvider {
    instance_name: Option<String>,
    action_cache_client: ActionCacheClient<LayeredService>,
}

impl ReapiActionCacheProvider {
    pub async fn new(options: RemoteStoreOptions) -> Result<ReapiActionCacheProvider, String> {
        let channel =
            rpc::create_channel(&options.store_address, Some(&options.tls_config)).await?;
        let service = rpc::layered_service(channel, &options.headers)?;
        Ok(ReapiActionCacheProvider {
            instance_name: options.instance_name,
            action_cache_client: ActionCacheClient::new(service),
        })
    }
}

#[async_trait]
impl ActionCacheProvider for ReapiActionCacheProvider {
    async fn update_action_result(
        &self,
        action_digest: Digest,
        action_result: remexec::ActionResult,
    ) -> Result<(), String> {
        let request = remexec::UpdateActionResultRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            action_digest: Some(action_digest.into()),
            action_result: Some(action_result),
        };

        retry_call(
            self.action_cache_client.clone(),
            move |mut client, _| {
                let request = request.clone();
                async move { client.update_action_result(request).await }
            },
            status_is_retryable,
        )
        .await
        .map(|_| ())
        .map_err(|err| status_to_str(&err))
    }

    async fn get_action_result(
        &self,
        action_digest: Digest,
        _build_id: &str,
    ) -> Result<Option<remexec::ActionResult>, String> {
        let request = remexec::GetActionResultRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            action_digest: Some(action_digest.into()),
            inline_stdout: false,
            inline_stderr: false,
        };

        let result = retry_call(
            self.action_cache_client.clone(),
            move |mut client, _| {
                let request = request.clone();
                async move { client.get_action_result(request).await }
            },
            status_is_retryable,
        )
        .await;

        match result {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(&status)),
        }
    }
}
