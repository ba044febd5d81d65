// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Message definitions, nested to mirror the proto packages so that references read the same
//! as they would against generated code.

pub mod google {
    pub mod rpc {
        /// `google.rpc.Status`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Status {
            #[prost(int32, tag = "1")]
            pub code: i32,
            #[prost(string, tag = "2")]
            pub message: ::prost::alloc::string::String,
            #[prost(message, repeated, tag = "3")]
            pub details: ::prost::alloc::vec::Vec<::prost_types::Any>,
        }
    }

    pub mod bytestream {
        /// `google.bytestream.ReadRequest`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ReadRequest {
            #[prost(string, tag = "1")]
            pub resource_name: ::prost::alloc::string::String,
            #[prost(int64, tag = "2")]
            pub read_offset: i64,
            /// Zero means "no limit".
            #[prost(int64, tag = "3")]
            pub read_limit: i64,
        }

        /// `google.bytestream.ReadResponse`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ReadResponse {
            #[prost(bytes = "bytes", tag = "10")]
            pub data: ::prost::bytes::Bytes,
        }

        /// `google.bytestream.WriteRequest`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct WriteRequest {
            /// Only required on the first request of a stream.
            #[prost(string, tag = "1")]
            pub resource_name: ::prost::alloc::string::String,
            #[prost(int64, tag = "2")]
            pub write_offset: i64,
            #[prost(bool, tag = "3")]
            pub finish_write: bool,
            #[prost(bytes = "bytes", tag = "10")]
            pub data: ::prost::bytes::Bytes,
        }

        /// `google.bytestream.WriteResponse`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct WriteResponse {
            #[prost(int64, tag = "1")]
            pub committed_size: i64,
        }

        /// `google.bytestream.QueryWriteStatusRequest`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct QueryWriteStatusRequest {
            #[prost(string, tag = "1")]
            pub resource_name: ::prost::alloc::string::String,
        }

        /// `google.bytestream.QueryWriteStatusResponse`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct QueryWriteStatusResponse {
            #[prost(int64, tag = "1")]
            pub committed_size: i64,
            #[prost(bool, tag = "2")]
            pub complete: bool,
        }
    }

    pub mod longrunning {
        /// `google.longrunning.Operation`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Operation {
            #[prost(string, tag = "1")]
            pub name: ::prost::alloc::string::String,
            #[prost(message, optional, tag = "2")]
            pub metadata: ::core::option::Option<::prost_types::Any>,
            #[prost(bool, tag = "3")]
            pub done: bool,
            #[prost(oneof = "operation::Result", tags = "4, 5")]
            pub result: ::core::option::Option<operation::Result>,
        }

        pub mod operation {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Result {
                #[prost(message, tag = "4")]
                Error(super::super::rpc::Status),
                #[prost(message, tag = "5")]
                Response(::prost_types::Any),
            }
        }
    }
}

pub mod build {
    pub mod bazel {
        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    /// `build.bazel.remote.execution.v2.Digest`.
                    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
                    pub struct Digest {
                        /// Lowercase hex.
                        #[prost(string, tag = "1")]
                        pub hash: ::prost::alloc::string::String,
                        #[prost(int64, tag = "2")]
                        pub size_bytes: i64,
                    }

                    pub fn empty_digest() -> Digest {
                        Digest {
                            hash: ::prost::alloc::string::String::from(
                                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                            ),
                            size_bytes: 0,
                        }
                    }

                    /// `build.bazel.remote.execution.v2.FileNode`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct FileNode {
                        #[prost(string, tag = "1")]
                        pub name: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "2")]
                        pub digest: ::core::option::Option<Digest>,
                        #[prost(bool, tag = "4")]
                        pub is_executable: bool,
                    }

                    /// `build.bazel.remote.execution.v2.DirectoryNode`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct DirectoryNode {
                        #[prost(string, tag = "1")]
                        pub name: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "2")]
                        pub digest: ::core::option::Option<Digest>,
                    }

                    /// `build.bazel.remote.execution.v2.SymlinkNode`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct SymlinkNode {
                        #[prost(string, tag = "1")]
                        pub name: ::prost::alloc::string::String,
                        #[prost(string, tag = "2")]
                        pub target: ::prost::alloc::string::String,
                    }

                    /// `build.bazel.remote.execution.v2.Directory`.
                    ///
                    /// The canonical form (sorted unique names, no `/` in names) is what the
                    /// content addressing in the rest of the system relies on: see
                    /// `verify_directory_canonical`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct Directory {
                        #[prost(message, repeated, tag = "1")]
                        pub files: ::prost::alloc::vec::Vec<FileNode>,
                        #[prost(message, repeated, tag = "2")]
                        pub directories: ::prost::alloc::vec::Vec<DirectoryNode>,
                        #[prost(message, repeated, tag = "3")]
                        pub symlinks: ::prost::alloc::vec::Vec<SymlinkNode>,
                    }

                    /// `build.bazel.remote.execution.v2.Tree`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct Tree {
                        #[prost(message, optional, tag = "1")]
                        pub root: ::core::option::Option<Directory>,
                        #[prost(message, repeated, tag = "2")]
                        pub children: ::prost::alloc::vec::Vec<Directory>,
                    }

                    /// `build.bazel.remote.execution.v2.Command`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct Command {
                        #[prost(string, repeated, tag = "1")]
                        pub arguments: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
                        #[prost(message, repeated, tag = "2")]
                        pub environment_variables:
                            ::prost::alloc::vec::Vec<command::EnvironmentVariable>,
                        #[prost(string, repeated, tag = "3")]
                        pub output_files:
                            ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
                        #[prost(string, repeated, tag = "4")]
                        pub output_directories:
                            ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
                        #[prost(message, optional, tag = "5")]
                        pub platform: ::core::option::Option<Platform>,
                        #[prost(string, tag = "6")]
                        pub working_directory: ::prost::alloc::string::String,
                        #[prost(string, repeated, tag = "7")]
                        pub output_paths:
                            ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
                    }

                    pub mod command {
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct EnvironmentVariable {
                            #[prost(string, tag = "1")]
                            pub name: ::prost::alloc::string::String,
                            #[prost(string, tag = "2")]
                            pub value: ::prost::alloc::string::String,
                        }
                    }

                    /// `build.bazel.remote.execution.v2.Platform`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct Platform {
                        #[prost(message, repeated, tag = "1")]
                        pub properties: ::prost::alloc::vec::Vec<platform::Property>,
                    }

                    pub mod platform {
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Property {
                            #[prost(string, tag = "1")]
                            pub name: ::prost::alloc::string::String,
                            #[prost(string, tag = "2")]
                            pub value: ::prost::alloc::string::String,
                        }
                    }

                    /// `build.bazel.remote.execution.v2.Action`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct Action {
                        #[prost(message, optional, tag = "1")]
                        pub command_digest: ::core::option::Option<Digest>,
                        #[prost(message, optional, tag = "2")]
                        pub input_root_digest: ::core::option::Option<Digest>,
                        #[prost(message, optional, tag = "6")]
                        pub timeout: ::core::option::Option<::prost_types::Duration>,
                        #[prost(bool, tag = "7")]
                        pub do_not_cache: bool,
                        #[prost(bytes = "bytes", tag = "9")]
                        pub salt: ::prost::bytes::Bytes,
                        #[prost(message, optional, tag = "10")]
                        pub platform: ::core::option::Option<Platform>,
                    }

                    /// `build.bazel.remote.execution.v2.OutputFile`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct OutputFile {
                        #[prost(string, tag = "1")]
                        pub path: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "2")]
                        pub digest: ::core::option::Option<Digest>,
                        #[prost(bool, tag = "4")]
                        pub is_executable: bool,
                        #[prost(bytes = "bytes", tag = "5")]
                        pub contents: ::prost::bytes::Bytes,
                    }

                    /// `build.bazel.remote.execution.v2.OutputDirectory`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct OutputDirectory {
                        #[prost(string, tag = "1")]
                        pub path: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "3")]
                        pub tree_digest: ::core::option::Option<Digest>,
                        #[prost(bool, tag = "4")]
                        pub is_topologically_sorted: bool,
                    }

                    /// `build.bazel.remote.execution.v2.OutputSymlink`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct OutputSymlink {
                        #[prost(string, tag = "1")]
                        pub path: ::prost::alloc::string::String,
                        #[prost(string, tag = "2")]
                        pub target: ::prost::alloc::string::String,
                    }

                    /// `build.bazel.remote.execution.v2.ExecutedActionMetadata`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct ExecutedActionMetadata {
                        #[prost(string, tag = "1")]
                        pub worker: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "2")]
                        pub queued_timestamp: ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "3")]
                        pub worker_start_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "4")]
                        pub worker_completed_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "5")]
                        pub input_fetch_start_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "6")]
                        pub input_fetch_completed_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "7")]
                        pub execution_start_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "8")]
                        pub execution_completed_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "9")]
                        pub output_upload_start_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                        #[prost(message, optional, tag = "10")]
                        pub output_upload_completed_timestamp:
                            ::core::option::Option<::prost_types::Timestamp>,
                    }

                    /// `build.bazel.remote.execution.v2.ActionResult`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct ActionResult {
                        #[prost(message, repeated, tag = "2")]
                        pub output_files: ::prost::alloc::vec::Vec<OutputFile>,
                        #[prost(message, repeated, tag = "3")]
                        pub output_directories: ::prost::alloc::vec::Vec<OutputDirectory>,
                        #[prost(int32, tag = "4")]
                        pub exit_code: i32,
                        #[prost(bytes = "bytes", tag = "5")]
                        pub stdout_raw: ::prost::bytes::Bytes,
                        #[prost(message, optional, tag = "6")]
                        pub stdout_digest: ::core::option::Option<Digest>,
                        #[prost(bytes = "bytes", tag = "7")]
                        pub stderr_raw: ::prost::bytes::Bytes,
                        #[prost(message, optional, tag = "8")]
                        pub stderr_digest: ::core::option::Option<Digest>,
                        #[prost(message, optional, tag = "9")]
                        pub execution_metadata:
                            ::core::option::Option<ExecutedActionMetadata>,
                        #[prost(message, repeated, tag = "12")]
                        pub output_symlinks: ::prost::alloc::vec::Vec<OutputSymlink>,
                    }

                    /// `build.bazel.remote.execution.v2.ExecuteRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct ExecuteRequest {
                        #[prost(string, tag = "1")]
                        pub instance_name: ::prost::alloc::string::String,
                        #[prost(bool, tag = "3")]
                        pub skip_cache_lookup: bool,
                        #[prost(message, optional, tag = "6")]
                        pub action_digest: ::core::option::Option<Digest>,
                    }

                    /// `build.bazel.remote.execution.v2.ExecuteResponse`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct ExecuteResponse {
                        #[prost(message, optional, tag = "1")]
                        pub result: ::core::option::Option<ActionResult>,
                        #[prost(bool, tag = "2")]
                        pub cached_result: bool,
                        #[prost(message, optional, tag = "3")]
                        pub status: ::core::option::Option<super::super::super::super::super::google::rpc::Status>,
                        #[prost(string, tag = "5")]
                        pub message: ::prost::alloc::string::String,
                    }

                    /// `build.bazel.remote.execution.v2.ExecuteOperationMetadata`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct ExecuteOperationMetadata {
                        #[prost(enumeration = "execution_stage::Value", tag = "1")]
                        pub stage: i32,
                        #[prost(message, optional, tag = "2")]
                        pub action_digest: ::core::option::Option<Digest>,
                    }

                    pub mod execution_stage {
                        #[derive(
                            Clone,
                            Copy,
                            Debug,
                            PartialEq,
                            Eq,
                            Hash,
                            PartialOrd,
                            Ord,
                            ::prost::Enumeration,
                        )]
                        #[repr(i32)]
                        pub enum Value {
                            Unknown = 0,
                            CacheCheck = 1,
                            Queued = 2,
                            Executing = 3,
                            Completed = 4,
                        }
                    }

                    /// `build.bazel.remote.execution.v2.WaitExecutionRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct WaitExecutionRequest {
                        #[prost(string, tag = "1")]
                        pub name: ::prost::alloc::string::String,
                    }

                    /// `build.bazel.remote.execution.v2.GetActionResultRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct GetActionResultRequest {
                        #[prost(string, tag = "1")]
                        pub instance_name: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "2")]
                        pub action_digest: ::core::option::Option<Digest>,
                        #[prost(bool, tag = "3")]
                        pub inline_stdout: bool,
                        #[prost(bool, tag = "4")]
                        pub inline_stderr: bool,
                    }

                    /// `build.bazel.remote.execution.v2.UpdateActionResultRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct UpdateActionResultRequest {
                        #[prost(string, tag = "1")]
                        pub instance_name: ::prost::alloc::string::String,
                        #[prost(message, optional, tag = "2")]
                        pub action_digest: ::core::option::Option<Digest>,
                        #[prost(message, optional, tag = "3")]
                        pub action_result: ::core::option::Option<ActionResult>,
                    }

                    /// `build.bazel.remote.execution.v2.FindMissingBlobsRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct FindMissingBlobsRequest {
                        #[prost(string, tag = "1")]
                        pub instance_name: ::prost::alloc::string::String,
                        #[prost(message, repeated, tag = "2")]
                        pub blob_digests: ::prost::alloc::vec::Vec<Digest>,
                    }

                    /// `build.bazel.remote.execution.v2.FindMissingBlobsResponse`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct FindMissingBlobsResponse {
                        #[prost(message, repeated, tag = "2")]
                        pub missing_blob_digests: ::prost::alloc::vec::Vec<Digest>,
                    }

                    /// `build.bazel.remote.execution.v2.BatchUpdateBlobsRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct BatchUpdateBlobsRequest {
                        #[prost(string, tag = "1")]
                        pub instance_name: ::prost::alloc::string::String,
                        #[prost(message, repeated, tag = "2")]
                        pub requests:
                            ::prost::alloc::vec::Vec<batch_update_blobs_request::Request>,
                    }

                    pub mod batch_update_blobs_request {
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Request {
                            #[prost(message, optional, tag = "1")]
                            pub digest: ::core::option::Option<super::Digest>,
                            #[prost(bytes = "bytes", tag = "2")]
                            pub data: ::prost::bytes::Bytes,
                        }
                    }

                    /// `build.bazel.remote.execution.v2.BatchUpdateBlobsResponse`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct BatchUpdateBlobsResponse {
                        #[prost(message, repeated, tag = "1")]
                        pub responses:
                            ::prost::alloc::vec::Vec<batch_update_blobs_response::Response>,
                    }

                    pub mod batch_update_blobs_response {
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Response {
                            #[prost(message, optional, tag = "1")]
                            pub digest: ::core::option::Option<super::Digest>,
                            #[prost(message, optional, tag = "2")]
                            pub status: ::core::option::Option<
                                super::super::super::super::super::super::google::rpc::Status,
                            >,
                        }
                    }

                    /// `build.bazel.remote.execution.v2.BatchReadBlobsRequest`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct BatchReadBlobsRequest {
                        #[prost(string, tag = "1")]
                        pub instance_name: ::prost::alloc::string::String,
                        #[prost(message, repeated, tag = "2")]
                        pub digests: ::prost::alloc::vec::Vec<Digest>,
                    }

                    /// `build.bazel.remote.execution.v2.BatchReadBlobsResponse`.
                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct BatchReadBlobsResponse {
                        #[prost(message, repeated, tag = "1")]
                        pub responses:
                            ::prost::alloc::vec::Vec<batch_read_blobs_response::Response>,
                    }

                    pub mod batch_read_blobs_response {
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Response {
                            #[prost(message, optional, tag = "1")]
                            pub digest: ::core::option::Option<super::Digest>,
                            #[prost(bytes = "bytes", tag = "2")]
                            pub data: ::prost::bytes::Bytes,
                            #[prost(message, optional, tag = "3")]
                            pub status: ::core::option::Option<
                                super::super::super::super::super::super::google::rpc::Status,
                            >,
                        }
                    }
                }
            }
        }
    }
}
