// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use cas::Store;
use futures::StreamExt;
use log::{debug, trace};
use prost::Message;
use reapi::ExecutionClient;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;
use reapi::gen::google::longrunning::{Operation, operation};
use remote::{ActionCacheProvider, ReapiActionCacheProvider, RemoteStoreOptions};
use rpc::LayeredService;
use rpc::retry::{retry_call, status_is_retryable};
use spans::{Metric, RunningWorkunit, in_workunit};
use tonic::{Code, Status};

use crate::{
    Context, FallibleProcessResult, Process, ProcessCacheScope, ProcessError, ProcessResultSource,
    make_execute_request, populate_fallible_execution_result,
};

///
/// A CommandRunner which executes processes on a remote execution service via the REAPI:
/// the Action and its inputs are uploaded to the remote CAS, the action cache is consulted,
/// and on a miss the `Execute` operation stream is driven to completion.
///
pub struct CommandRunner {
    instance_name: Option<String>,
    process_cache_namespace: Option<String>,
    store: Store,
    execution_client: ExecutionClient<LayeredService>,
    action_cache: Arc<dyn ActionCacheProvider>,
}

impl CommandRunner {
    pub async fn new(
        execution_address: &str,
        options: RemoteStoreOptions,
        process_cache_namespace: Option<String>,
        store: Store,
    ) -> Result<CommandRunner, String> {
        let channel = rpc::create_channel(execution_address, Some(&options.tls_config)).await?;
        let service = rpc::layered_service(channel, &options.headers)?;
        let action_cache = Arc::new(ReapiActionCacheProvider::new(options.clone()).await?);
        Ok(CommandRunner {
            instance_name: options.instance_name.clone(),
            process_cache_namespace,
            store,
            execution_client: ExecutionClient::new(service),
            action_cache,
        })
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("remote_exec::CommandRunner")
            .field("instance_name", &self.instance_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        _workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        let request = make_execute_request(
            &req,
            self.instance_name.clone(),
            self.process_cache_namespace.clone(),
        )?;

        in_workunit!(
            "run_remote_process",
            req.level,
            desc = Some(req.description.clone()),
            |workunit| async move {
                workunit.increment_counter(Metric::RemoteExecutionRequests, 1);

                // Upload the Action, Command, and input root before anything references
                // them remotely.
                let (action_digest, command_digest) = futures::try_join!(
                    self.store
                        .store_file_bytes(reapi::MessageExt::to_bytes(&request.action), true),
                    self.store
                        .store_file_bytes(reapi::MessageExt::to_bytes(&request.command), true),
                )?;
                self.store
                    .ensure_remote_has_recursive(vec![
                        action_digest,
                        command_digest,
                        req.input_digest.as_digest(),
                    ])
                    .await?;

                // Consult the action cache.
                if req.cache_scope != ProcessCacheScope::Never {
                    workunit.increment_counter(Metric::RemoteCacheRequests, 1);
                    if let Some(action_result) = self
                        .action_cache
                        .get_action_result(request.action_digest, &context.build_id)
                        .await
                        .map_err(ProcessError::Unclassified)?
                    {
                        workunit.increment_counter(Metric::RemoteCacheRequestsCached, 1);
                        let result = populate_fallible_execution_result(
                            self.store.clone(),
                            context.run_id,
                            &action_result,
                            false,
                            ProcessResultSource::HitRemotely,
                            req.execution_environment.clone(),
                        )
                        .await?;
                        // The outputs must exist locally before the hit is claimed.
                        self.store
                            .ensure_local_has_recursive_directory(result.output_directory.clone())
                            .await?;
                        return Ok(result);
                    }
                    workunit.increment_counter(Metric::RemoteCacheRequestsUncached, 1);
                }

                // Execute remotely, retrying the whole operation stream on transient
                // transport failures.
                let execute_response = retry_call(
                    self.execution_client.clone(),
                    |mut client, retries| {
                        let execute_request = remexec::ExecuteRequest {
                            instance_name: self.instance_name.clone().unwrap_or_default(),
                            skip_cache_lookup: req.cache_scope == ProcessCacheScope::Never,
                            action_digest: Some(request.action_digest.into()),
                        };
                        async move {
                            if retries > 0 {
                                if let Some(handle) = spans::get_workunit_store_handle() {
                                    handle
                                        .store
                                        .increment_counter(Metric::RemoteExecutionRpcRetries, 1);
                                }
                            }
                            let stream = client.execute(execute_request).await?.into_inner();
                            drive_operation_stream(stream).await
                        }
                    },
                    status_is_retryable,
                )
                .await
                .map_err(|status| {
                    ProcessError::Unclassified(format!(
                        "Remote execution failed after retries: {}",
                        rpc::status_to_str(&status)
                    ))
                })?;

                // A non-OK status in the response is a scheduling/infrastructure error;
                // process-level failure is carried by the exit code instead.
                if let Some(status) = &execute_response.status {
                    if status.code != Code::Ok as i32 {
                        workunit.increment_counter(Metric::RemoteExecutionRpcErrors, 1);
                        return Err(ProcessError::Unclassified(format!(
                            "Remote execution failed: {} {}",
                            status.code, status.message
                        )));
                    }
                }
                let action_result = execute_response.result.as_ref().ok_or_else(|| {
                    ProcessError::Unclassified(
                        "ExecuteResponse was missing an ActionResult".to_owned(),
                    )
                })?;

                let result = populate_fallible_execution_result(
                    self.store.clone(),
                    context.run_id,
                    action_result,
                    false,
                    if execute_response.cached_result {
                        ProcessResultSource::HitRemotely
                    } else {
                        ProcessResultSource::Ran
                    },
                    req.execution_environment.clone(),
                )
                .await?;
                self.store
                    .ensure_local_has_recursive_directory(result.output_directory.clone())
                    .await?;

                workunit.increment_counter(Metric::RemoteExecutionSuccess, 1);
                Ok(result)
            }
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

///
/// Consumes an `Execute` operation stream until the operation completes, returning its
/// final `ExecuteResponse`.
///
async fn drive_operation_stream(
    mut stream: tonic::codec::Streaming<Operation>,
) -> Result<remexec::ExecuteResponse, Status> {
    while let Some(operation) = stream.next().await {
        let operation = operation?;
        if let Some(metadata) = &operation.metadata {
            if let Ok(metadata) =
                remexec::ExecuteOperationMetadata::decode(&metadata.value[..])
            {
                trace!("Remote execution stage: {:?}", metadata.stage);
            }
        }
        if !operation.done {
            continue;
        }

        return match operation.result {
            Some(operation::Result::Error(status)) => {
                Err(Status::new(Code::from(status.code), status.message.clone()))
            }
            Some(operation::Result::Response(any)) => {
                remexec::ExecuteResponse::decode(&any.value[..]).map_err(|err| {
                    Status::internal(format!("Invalid ExecuteResponse: {err:?}"))
                })
            }
            None => Err(Status::internal(
                "Operation completed with neither a response nor an error",
            )),
        };
    }

    debug!("Execute stream ended before the operation completed");
    Err(Status::unavailable(
        "The operation stream ended before the operation completed",
    ))
}
