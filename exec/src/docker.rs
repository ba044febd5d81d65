// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::models::HostConfig;
use bytes::BytesMut;
use cas::Store;
use futures::StreamExt;
use pool::Executor;
use spans::{Metric, RunningWorkunit, in_workunit};

use crate::local::{KeepSandboxes, apply_chroot, create_sandbox, prepare_workdir};
use crate::{
    Context, FallibleProcessResult, NamedCaches, Process, ProcessError, ProcessExecutionStrategy,
    ProcessResultMetadata, ProcessResultSource,
};

/// The path at which the sandbox is bind-mounted inside the container.
const SANDBOX_PATH_IN_CONTAINER: &str = "/gantry-sandbox";

///
/// A CommandRunner which executes processes in docker containers, with the sandbox prepared
/// on the host and bind-mounted in. Execution is local in every other respect: inputs are
/// materialised by the host store, and outputs are captured from the host side of the
/// mount.
///
pub struct CommandRunner {
    store: Store,
    executor: Executor,
    work_dir_base: PathBuf,
    named_caches: NamedCaches,
    keep_sandboxes: KeepSandboxes,
    docker: Docker,
}

impl CommandRunner {
    pub fn new(
        store: Store,
        executor: Executor,
        work_dir_base: PathBuf,
        named_caches: NamedCaches,
        keep_sandboxes: KeepSandboxes,
    ) -> Result<CommandRunner, String> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| format!("Failed to connect to the docker daemon: {err:?}"))?;
        Ok(CommandRunner {
            store,
            executor,
            work_dir_base,
            named_caches,
            keep_sandboxes,
            docker,
        })
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("docker::CommandRunner").finish_non_exhaustive()
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
        let image = match &req.execution_environment.strategy {
            ProcessExecutionStrategy::Docker(image) => image.clone(),
            strategy => {
                return Err(ProcessError::Unclassified(format!(
                    "The docker runner cannot execute processes with strategy {strategy:?}"
                )));
            }
        };

        in_workunit!(
            "run_docker_process",
            req.level,
            desc = Some(req.description.clone()),
            |workunit| async move {
                workunit.increment_counter(Metric::DockerExecutionRequests, 1);
                let start_time = Instant::now();

                let mut workdir = create_sandbox(
                    self.executor.clone(),
                    &self.work_dir_base,
                    &req.description,
                    self.keep_sandboxes,
                )?;

                let mut req = req;
                // Paths the process observes are container paths.
                apply_chroot(SANDBOX_PATH_IN_CONTAINER, &mut req);
                prepare_workdir(
                    workdir.path().to_owned(),
                    &self.work_dir_base,
                    &req,
                    req.input_digest.clone(),
                    &self.store,
                    &self.named_caches,
                )
                .await?;

                let result = self
                    .run_container(&context, &req, workdir.path().to_owned(), image, start_time)
                    .await;

                match &result {
                    Ok(_) => workunit.increment_counter(Metric::DockerExecutionSuccesses, 1),
                    Err(_) => workunit.increment_counter(Metric::DockerExecutionErrors, 1),
                }

                if self.keep_sandboxes == KeepSandboxes::OnFailure
                    && result.as_ref().map(|r| r.exit_code).unwrap_or(1) != 0
                {
                    workdir.keep(&req.description);
                }

                result
            }
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

impl CommandRunner {
    async fn run_container(
        &self,
        context: &Context,
        req: &Process,
        sandbox_path: PathBuf,
        image: String,
        start_time: Instant,
    ) -> Result<FallibleProcessResult, ProcessError> {
        let working_dir = match &req.working_directory {
            Some(wd) => format!("{SANDBOX_PATH_IN_CONTAINER}/{wd}"),
            None => SANDBOX_PATH_IN_CONTAINER.to_owned(),
        };
        let container_name = format!("gantry-exec-{}", uuid_fragment(context, req));

        let config = Config {
            image: Some(image),
            cmd: Some(req.argv.clone()),
            env: Some(
                req.env
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect(),
            ),
            working_dir: Some(working_dir),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{SANDBOX_PATH_IN_CONTAINER}",
                    sandbox_path.display()
                )]),
                init: Some(true),
                ..HostConfig::default()
            }),
            ..Config::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| format!("Failed to create docker container: {err:?}"))?;

        let run_result = self.wait_for_container(&container_name, req).await;

        // Containers are removed regardless of the outcome.
        let _ = self
            .docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..RemoveContainerOptions::default()
                }),
            )
            .await;

        let (exit_code, stdout, stderr) = run_result?;

        // Capture declared outputs from the host side of the bind mount.
        let output_snapshot = if req.output_files.is_empty() && req.output_directories.is_empty() {
            cas::Snapshot::empty()
        } else {
            let root = match &req.working_directory {
                Some(wd) => sandbox_path.join(wd),
                None => sandbox_path,
            };
            let posix_fs = Arc::new(
                vfs::PosixFS::new(
                    root,
                    vfs::GitignoreStyleExcludes::empty(),
                    self.executor.clone(),
                )
                .map_err(|err| format!("Error capturing docker process outputs: {err}"))?,
            );
            super::local::CommandRunner::construct_output_snapshot(
                self.store.clone(),
                posix_fs,
                req.output_files.clone(),
                req.output_directories.clone(),
            )
            .await?
        };
        let output_directory: vfs::DirectoryDigest = output_snapshot.into();
        self.store
            .record_digest_trie(output_directory.tree.clone().unwrap(), true)
            .await?;

        let (stdout_digest, stderr_digest) = futures::try_join!(
            self.store.store_file_bytes(stdout.into(), true),
            self.store.store_file_bytes(stderr.into(), true),
        )?;

        Ok(FallibleProcessResult {
            stdout_digest,
            stderr_digest,
            exit_code,
            output_directory,
            metadata: ProcessResultMetadata::new(
                Some(start_time.elapsed()),
                ProcessResultSource::Ran,
                req.execution_environment.clone(),
                context.run_id,
            ),
        })
    }

    async fn wait_for_container(
        &self,
        container_name: &str,
        req: &Process,
    ) -> Result<(i32, BytesMut, BytesMut), ProcessError> {
        self.docker
            .start_container::<String>(container_name, None)
            .await
            .map_err(|err| format!("Failed to start docker container: {err:?}"))?;

        let mut stdout = BytesMut::with_capacity(8192);
        let mut stderr = BytesMut::with_capacity(8192);
        let mut logs = self.docker.logs::<String>(
            container_name,
            Some(LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..LogsOptions::default()
            }),
        );

        let collect = async {
            while let Some(log) = logs.next().await {
                match log.map_err(|err| format!("Failed to read docker logs: {err:?}"))? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => (),
                }
            }

            let mut wait = self
                .docker
                .wait_container::<String>(container_name, None::<WaitContainerOptions<String>>);
            let status_code = match wait.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(err)) => {
                    return Err(format!("Failed to wait for docker container: {err:?}"));
                }
                None => return Err("Docker wait stream ended unexpectedly".to_owned()),
            };
            Ok(status_code as i32)
        };

        let exit_code = if let Some(req_timeout) = req.timeout {
            match tokio::time::timeout(req_timeout, collect).await {
                Ok(result) => result?,
                Err(_) => {
                    // Kill the container group and report the distinguished timeout exit.
                    let _ = self.docker.kill_container::<String>(container_name, None).await;
                    crate::TIMED_OUT_EXIT_CODE
                }
            }
        } else {
            collect.await?
        };

        Ok((exit_code, stdout, stderr))
    }
}

/// A unique-enough container name fragment from the run and process identity.
fn uuid_fragment(context: &Context, req: &Process) -> String {
    let digest = crate::make_execute_request(req, None, None)
        .map(|r| r.action_digest.hash.to_hex())
        .unwrap_or_default();
    format!("{}-{}", context.run_id.0, &digest[0..12.min(digest.len())])
}
