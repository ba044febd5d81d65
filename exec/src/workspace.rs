// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use cas::Store;
use pool::Executor;
use spans::{RunningWorkunit, in_workunit};
use tokio::sync::RwLock;

use crate::local::{CommandRunner as LocalCommandRunner, collect_child_outputs};
use crate::{
    Context, FallibleProcessResult, NamedCaches, Process, ProcessError, ProcessResultMetadata,
    ProcessResultSource,
};

///
/// A runner for processes which execute against the live workspace rather than a sandbox.
///
/// Such processes can observe and mutate the build root, so their results are never
/// memoised (`Process::validate` forces `CacheScope::Never`), and output capture is
/// restricted to stdio.
///
pub struct CommandRunner {
    store: Store,
    executor: Executor,
    build_root: PathBuf,
    named_caches: NamedCaches,
    spawn_lock: Arc<RwLock<()>>,
}

impl CommandRunner {
    pub fn new(
        store: Store,
        executor: Executor,
        build_root: PathBuf,
        named_caches: NamedCaches,
    ) -> CommandRunner {
        CommandRunner {
            store,
            executor,
            build_root,
            named_caches: named_caches,
            spawn_lock: Arc::new(RwLock::new(())),
        }
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("workspace::CommandRunner")
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
        req.validate()?;

        in_workunit!(
            "run_workspace_process",
            req.level,
            desc = Some(req.description.clone()),
            |_workunit| async move {
                let start_time = std::time::Instant::now();

                // Materialising inputs into the workspace would clobber user files, so
                // workspace processes run against the build root exactly as it is; their
                // inputs must already be present.
                let local_runner = LocalCommandRunner::new(
                    self.store.clone(),
                    self.executor.clone(),
                    self.build_root.clone(),
                    self.named_caches.clone(),
                    crate::local::KeepSandboxes::Never,
                    std::time::Duration::from_secs(2),
                );
                let _spawn_guard = self.spawn_lock.read().await;

                let mut stdout = BytesMut::with_capacity(8192);
                let mut stderr = BytesMut::with_capacity(8192);
                let stream = local_runner
                    .run_in_workdir(&context, &self.build_root, req.clone(), false)
                    .await?;
                let exit_code_result = if let Some(req_timeout) = req.timeout {
                    tokio::time::timeout(
                        req_timeout,
                        collect_child_outputs(&mut stdout, &mut stderr, stream),
                    )
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r)
                } else {
                    collect_child_outputs(&mut stdout, &mut stderr, stream).await
                };

                let exit_code = match exit_code_result {
                    Ok(exit_code) => exit_code,
                    Err(msg) if msg == "deadline has elapsed" => crate::TIMED_OUT_EXIT_CODE,
                    Err(msg) => return Err(ProcessError::Unclassified(msg)),
                };

                let (stdout_digest, stderr_digest) = futures::try_join!(
                    self.store.store_file_bytes(stdout.into(), true),
                    self.store.store_file_bytes(stderr.into(), true),
                )?;

                Ok(FallibleProcessResult {
                    stdout_digest,
                    stderr_digest,
                    exit_code,
                    output_directory: vfs::EMPTY_DIRECTORY_DIGEST.clone(),
                    metadata: ProcessResultMetadata::new(
                        Some(start_time.elapsed()),
                        ProcessResultSource::Ran,
                        req.execution_environment,
                        context.run_id,
                    ),
                })
            }
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}
