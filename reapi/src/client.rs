// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Clients for the REAPI services, written against `tonic::client::Grpc` in the same shape
//! `tonic-build` would generate.

use tonic::codegen::{Body, Bytes, StdError, http};

use crate::gen::build::bazel::remote::execution::v2 as remexec;
use crate::gen::google::bytestream;
use crate::gen::google::longrunning::Operation;

macro_rules! ready {
    ($inner: expr) => {
        $inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
        })?
    };
}

/// `build.bazel.remote.execution.v2.ContentAddressableStorage`.
#[derive(Debug, Clone)]
pub struct ContentAddressableStorageClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> ContentAddressableStorageClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    pub async fn find_missing_blobs(
        &mut self,
        request: impl tonic::IntoRequest<remexec::FindMissingBlobsRequest>,
    ) -> Result<tonic::Response<remexec::FindMissingBlobsResponse>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .unary(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn batch_update_blobs(
        &mut self,
        request: impl tonic::IntoRequest<remexec::BatchUpdateBlobsRequest>,
    ) -> Result<tonic::Response<remexec::BatchUpdateBlobsResponse>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .unary(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchUpdateBlobs",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn batch_read_blobs(
        &mut self,
        request: impl tonic::IntoRequest<remexec::BatchReadBlobsRequest>,
    ) -> Result<tonic::Response<remexec::BatchReadBlobsResponse>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .unary(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }
}

/// `build.bazel.remote.execution.v2.ActionCache`.
#[derive(Debug, Clone)]
pub struct ActionCacheClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> ActionCacheClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    pub async fn get_action_result(
        &mut self,
        request: impl tonic::IntoRequest<remexec::GetActionResultRequest>,
    ) -> Result<tonic::Response<remexec::ActionResult>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .unary(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.ActionCache/GetActionResult",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn update_action_result(
        &mut self,
        request: impl tonic::IntoRequest<remexec::UpdateActionResultRequest>,
    ) -> Result<tonic::Response<remexec::ActionResult>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .unary(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.ActionCache/UpdateActionResult",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }
}

/// `build.bazel.remote.execution.v2.Execution`.
#[derive(Debug, Clone)]
pub struct ExecutionClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> ExecutionClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    pub async fn execute(
        &mut self,
        request: impl tonic::IntoRequest<remexec::ExecuteRequest>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<Operation>>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .server_streaming(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.Execution/Execute",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn wait_execution(
        &mut self,
        request: impl tonic::IntoRequest<remexec::WaitExecutionRequest>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<Operation>>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .server_streaming(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/build.bazel.remote.execution.v2.Execution/WaitExecution",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }
}

/// `google.bytestream.ByteStream`.
#[derive(Debug, Clone)]
pub struct ByteStreamClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> ByteStreamClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    pub async fn read(
        &mut self,
        request: impl tonic::IntoRequest<bytestream::ReadRequest>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<bytestream::ReadResponse>>, tonic::Status>
    {
        ready!(self.inner);
        self.inner
            .server_streaming(
                request.into_request(),
                http::uri::PathAndQuery::from_static("/google.bytestream.ByteStream/Read"),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn write(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = bytestream::WriteRequest>,
    ) -> Result<tonic::Response<bytestream::WriteResponse>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .client_streaming(
                request.into_streaming_request(),
                http::uri::PathAndQuery::from_static("/google.bytestream.ByteStream/Write"),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn query_write_status(
        &mut self,
        request: impl tonic::IntoRequest<bytestream::QueryWriteStatusRequest>,
    ) -> Result<tonic::Response<bytestream::QueryWriteStatusResponse>, tonic::Status> {
        ready!(self.inner);
        self.inner
            .unary(
                request.into_request(),
                http::uri::PathAndQuery::from_static(
                    "/google.bytestream.ByteStream/QueryWriteStatus",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
    }
}
