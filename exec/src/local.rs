// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{self, Debug};
use std::fs::OpenOptions;
use std::io::Write;
use std::ops::Neg;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cas::{OneOffStoreFileByDigest, Snapshot, SnapshotOps, Store, StoreError};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use futures::{FutureExt, TryFutureExt, try_join};
use log::debug;
use pool::Executor;
use spans::{Level, Metric, RunningWorkunit, in_workunit};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::{Duration, timeout};
use tokio_util::codec::{BytesCodec, FramedRead};
use vfs::directory::{DigestTrie, TypedPath};
use vfs::{
    DirectoryDigest, GlobExpansionConjunction, GlobMatching, PathGlobs, Permissions, RelativePath,
    StrictGlobMatching, SymlinkBehavior,
};

use crate::{
    Context, FallibleProcessResult, ManagedChild, NamedCaches, Process, ProcessError,
    ProcessResultMetadata, ProcessResultSource, TIMED_OUT_EXIT_CODE,
};

pub const USER_EXECUTABLE_MODE: u32 = 0o100755;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum KeepSandboxes {
    Always,
    Never,
    OnFailure,
}

pub struct CommandRunner {
    pub store: Store,
    executor: Executor,
    work_dir_base: PathBuf,
    named_caches: NamedCaches,
    keep_sandboxes: KeepSandboxes,
    graceful_shutdown_timeout: Duration,
    spawn_lock: Arc<RwLock<()>>,
}

impl CommandRunner {
    pub fn new(
        store: Store,
        executor: Executor,
        work_dir_base: PathBuf,
        named_caches: NamedCaches,
        keep_sandboxes: KeepSandboxes,
        graceful_shutdown_timeout: Duration,
    ) -> CommandRunner {
        CommandRunner {
            store,
            executor,
            work_dir_base,
            named_caches,
            keep_sandboxes,
            graceful_shutdown_timeout,
            spawn_lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn named_caches(&self) -> &NamedCaches {
        &self.named_caches
    }

    pub(crate) async fn construct_output_snapshot(
        store: Store,
        posix_fs: Arc<vfs::PosixFS>,
        output_file_paths: BTreeSet<RelativePath>,
        output_dir_paths: BTreeSet<RelativePath>,
    ) -> Result<Snapshot, String> {
        let output_paths = output_dir_paths
            .into_iter()
            .flat_map(|p| {
                let mut dir_glob = {
                    let mut dir = PathBuf::from(p).into_os_string();
                    if dir.is_empty() {
                        dir.push(".")
                    }
                    dir
                };
                let dir = dir_glob.clone();
                dir_glob.push("/**");
                vec![dir, dir_glob]
            })
            .chain(
                output_file_paths
                    .into_iter()
                    .map(|p| PathBuf::from(p).into_os_string()),
            )
            .map(|s| {
                s.into_string()
                    .map_err(|e| format!("Error stringifying output paths: {e:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // No ignore patterns: the paths were explicitly listed.
        let output_globs = PathGlobs::new(
            output_paths,
            StrictGlobMatching::Ignore,
            GlobExpansionConjunction::AllMatch,
        )
        .parse()?;

        let path_stats = posix_fs
            .expand_globs(output_globs, SymlinkBehavior::Aware, None)
            .map_err(|err| format!("Error expanding output globs: {err}"))
            .await?;
        Snapshot::from_path_stats(
            OneOffStoreFileByDigest::new(store, posix_fs, true),
            path_stats,
        )
        .await
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("local::CommandRunner").finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChildOutput {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

///
/// Collects the outputs of a child process stream.
///
pub async fn collect_child_outputs<'a, 'b>(
    stdout: &'a mut BytesMut,
    stderr: &'a mut BytesMut,
    mut stream: BoxStream<'b, Result<ChildOutput, String>>,
) -> Result<i32, String> {
    let mut exit_code = 1;

    while let Some(child_output_res) = stream.next().await {
        match child_output_res? {
            ChildOutput::Stdout(bytes) => stdout.extend_from_slice(&bytes),
            ChildOutput::Stderr(bytes) => stderr.extend_from_slice(&bytes),
            ChildOutput::Exit(code) => exit_code = code,
        }
    }

    Ok(exit_code)
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    ///
    /// Runs a command on this machine in a hermetic sandbox under `work_dir_base`.
    ///
    async fn run(
        &self,
        context: Context,
        _workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        let req_debug_repr = format!("{req:#?}");
        in_workunit!(
            "run_local_process",
            req.level,
            desc = Some(req.description.clone()),
            |workunit| async move {
                let mut workdir = create_sandbox(
                    self.executor.clone(),
                    &self.work_dir_base,
                    &req.description,
                    self.keep_sandboxes,
                )?;

                // Start working on a mutable version of the process.
                let mut req = req;
                // Update env and argv, replacing `{chroot}` placeholders with the sandbox
                // path.
                apply_chroot(workdir.path().to_str().unwrap(), &mut req);

                let exclusive_spawn = prepare_workdir(
                    workdir.path().to_owned(),
                    &self.work_dir_base,
                    &req,
                    req.input_digest.clone(),
                    &self.store,
                    &self.named_caches,
                )
                .await?;

                workunit.increment_counter(Metric::LocalExecutionRequests, 1);
                let res = self
                    .run_and_capture_workdir(
                        req.clone(),
                        context,
                        self.store.clone(),
                        self.executor.clone(),
                        workdir.path().to_owned(),
                        exclusive_spawn,
                    )
                    .map_err(|msg| {
                        // Processes that fail at this level (rather than with an exit code)
                        // could not be started or interacted with at all, which generally
                        // indicates an infrastructure error: the entire definition is
                        // dumped for debugging.
                        ProcessError::Unclassified(format!(
                            "Failed to execute: {req_debug_repr}\n\n{msg}"
                        ))
                    })
                    .await;

                if self.keep_sandboxes == KeepSandboxes::Always
                    || self.keep_sandboxes == KeepSandboxes::OnFailure
                        && res.as_ref().map(|r| r.exit_code).unwrap_or(1) != 0
                {
                    workdir.keep(&req.description);
                    setup_run_sh_script(workdir.path(), &req.env, &req.working_directory, &req.argv)?;
                }

                res
            }
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

impl CommandRunner {
    async fn run_and_capture_workdir(
        &self,
        req: Process,
        context: Context,
        store: Store,
        executor: Executor,
        workdir_path: PathBuf,
        exclusive_spawn: bool,
    ) -> Result<FallibleProcessResult, String> {
        let start_time = Instant::now();
        let mut stdout = BytesMut::with_capacity(8192);
        let mut stderr = BytesMut::with_capacity(8192);

        // NB: The stream is fully buffered into the stdout/stderr buffers for now; passing
        // incremental output down the line for live streaming is the eventual goal.
        let exit_code_result = {
            let exit_code_future = collect_child_outputs(
                &mut stdout,
                &mut stderr,
                self.run_in_workdir(&context, &workdir_path, req.clone(), exclusive_spawn)
                    .await?,
            );
            if let Some(req_timeout) = req.timeout {
                timeout(req_timeout, exit_code_future)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r)
            } else {
                exit_code_future.await
            }
        };

        // Capture the process outputs.
        let output_snapshot = if req.output_files.is_empty() && req.output_directories.is_empty() {
            Snapshot::empty()
        } else {
            let root = if let Some(ref working_directory) = req.working_directory {
                workdir_path.join(working_directory)
            } else {
                workdir_path.clone()
            };
            let posix_fs = Arc::new(
                vfs::PosixFS::new(root, vfs::GitignoreStyleExcludes::empty(), executor.clone())
                    .map_err(|err| {
                        format!(
                            "Error making posix_fs to fetch local process execution output files: {err}"
                        )
                    })?,
            );
            CommandRunner::construct_output_snapshot(
                store.clone(),
                posix_fs,
                req.output_files,
                req.output_directories,
            )
            .await?
        };
        let output_directory: DirectoryDigest = output_snapshot.into();
        store
            .record_digest_trie(output_directory.tree.clone().unwrap(), true)
            .await?;

        let elapsed = start_time.elapsed();
        let result_metadata = ProcessResultMetadata::new(
            Some(elapsed),
            ProcessResultSource::Ran,
            req.execution_environment,
            context.run_id,
        );

        match exit_code_result {
            Ok(exit_code) => {
                let (stdout_digest, stderr_digest) = try_join!(
                    store.store_file_bytes(stdout.into(), true),
                    store.store_file_bytes(stderr.into(), true),
                )?;
                Ok(FallibleProcessResult {
                    stdout_digest,
                    stderr_digest,
                    exit_code,
                    output_directory,
                    metadata: result_metadata,
                })
            }
            Err(msg) if msg == "deadline has elapsed" => {
                // The timeout elapsed: the child (and its process group) has been killed by
                // dropping it, and the result carries the distinguished timed-out exit.
                stderr.extend_from_slice(
                    format!(
                        "\n\nExceeded timeout of {:.1} seconds when executing local process: {}",
                        req.timeout.map(|dur| dur.as_secs_f32()).unwrap_or(-1.0),
                        req.description
                    )
                    .as_bytes(),
                );

                let (stdout_digest, stderr_digest) = try_join!(
                    store.store_file_bytes(stdout.into(), true),
                    store.store_file_bytes(stderr.into(), true),
                )?;

                Ok(FallibleProcessResult {
                    stdout_digest,
                    stderr_digest,
                    exit_code: TIMED_OUT_EXIT_CODE,
                    output_directory: vfs::EMPTY_DIRECTORY_DIGEST.clone(),
                    metadata: result_metadata,
                })
            }
            Err(msg) => Err(msg),
        }
    }

    ///
    /// Spawns the process in the prepared working directory.
    ///
    /// `exclusive_spawn` indicates that the executable being spawned was written out by this
    /// process: concurrent fork+execs may then hold its file descriptor open (cloned at
    /// their fork point but not yet closed by exec's O_CLOEXEC), which surfaces as ETXTBSY.
    /// Exclusive spawns take a write lock so that all concurrent non-exclusive spawns have
    /// passed their exec point first.
    ///
    pub(crate) async fn run_in_workdir(
        &self,
        _context: &Context,
        workdir_path: &Path,
        req: Process,
        exclusive_spawn: bool,
    ) -> Result<BoxStream<'static, Result<ChildOutput, String>>, String> {
        let cwd = if let Some(ref working_directory) = req.working_directory {
            workdir_path.join(working_directory)
        } else {
            workdir_path.to_owned()
        };
        let mut command = Command::new(&req.argv[0]);
        command
            .env_clear()
            // Setting an empty PATH is the only way to stop automatic PATH searching.
            .env("PATH", "")
            .args(&req.argv[1..])
            .current_dir(cwd)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let graceful_shutdown_timeout = self.graceful_shutdown_timeout;
        let mut child = {
            if exclusive_spawn {
                let _write_locked = self.spawn_lock.write().await;

                // Despite the mitigation against racing our own forks, forks can happen in
                // this process outside of our control (in libraries): back-stop by retrying
                // for a bounded period if we hit a fork race anyway.
                const MAX_ETXTBSY_WAIT: Duration = Duration::from_millis(100);
                let mut retries: u32 = 0;
                let mut sleep_millis = 1;

                let start_time = Instant::now();
                loop {
                    match ManagedChild::spawn(&mut command, Some(graceful_shutdown_timeout)) {
                        Err(e) => {
                            if e.raw_os_error() == Some(libc::ETXTBSY)
                                && start_time.elapsed() < MAX_ETXTBSY_WAIT
                            {
                                tokio::time::sleep(Duration::from_millis(sleep_millis)).await;
                                retries += 1;
                                sleep_millis *= 2;
                            } else if retries > 0 {
                                break Err(format!(
                                    "Error launching process after {retries} {} for ETXTBSY. \
                   Final error was: {e:?}",
                                    if retries == 1 { "retry" } else { "retries" },
                                ));
                            } else {
                                break Err(format!("Error launching process: {e:?}"));
                            }
                        }
                        Ok(child) => break Ok(child),
                    }
                }
            } else {
                let _read_locked = self.spawn_lock.read().await;
                ManagedChild::spawn(&mut command, Some(graceful_shutdown_timeout))
                    .map_err(|e| format!("Error launching process: {e:?}"))
            }
        }?;

        debug!("spawned local process as {:?} for {:?}", child.id(), req);
        let stdout_stream = FramedRead::new(child.stdout.take().unwrap(), BytesCodec::new())
            .map_ok(|bytes| ChildOutput::Stdout(bytes.into()))
            .fuse()
            .boxed();
        let stderr_stream = FramedRead::new(child.stderr.take().unwrap(), BytesCodec::new())
            .map_ok(|bytes| ChildOutput::Stderr(bytes.into()))
            .fuse()
            .boxed();
        let exit_stream = async move {
            child
                .wait()
                .map_ok(|exit_status| {
                    ChildOutput::Exit(
                        exit_status
                            .code()
                            .or_else(|| exit_status.signal().map(Neg::neg))
                            .expect("Child process should exit via returned code or signal."),
                    )
                })
                .await
        }
        .into_stream()
        .boxed();
        let result_stream =
            futures::stream::select_all(vec![stdout_stream, stderr_stream, exit_stream]);

        Ok(result_stream
            .map_err(|e| format!("Failed to consume process outputs: {e:?}"))
            .boxed())
    }
}

///
/// Mutates a Process, replacing any `{chroot}` placeholders with the sandbox path.
///
pub fn apply_chroot(chroot_path: &str, req: &mut Process) {
    for value in req.env.values_mut() {
        if value.contains("{chroot}") {
            *value = value.replace("{chroot}", chroot_path);
        }
    }
    for value in &mut req.argv {
        if value.contains("{chroot}") {
            *value = value.replace("{chroot}", chroot_path);
        }
    }
}

///
/// Creates the complete input digest for the given Process: its input digest, plus symlinks
/// for named caches and the JDK, plus the parent directories of declared outputs (which the
/// REAPI requires to exist before execution).
///
pub async fn prepare_workdir_digest(
    req: &Process,
    input_digest: DirectoryDigest,
    store: &Store,
    named_caches: &NamedCaches,
) -> Result<DirectoryDigest, StoreError> {
    let mut paths = Vec::new();

    let workdir_symlinks = named_caches.paths(&req.append_only_caches).await.map_err(|err| {
        StoreError::Unclassified(format!(
            "Failed to make named cache(s) for local execution: {err:?}"
        ))
    })?;
    paths.extend(workdir_symlinks.iter().map(|symlink| TypedPath::Link {
        path: &symlink.src,
        target: &symlink.dst,
    }));

    if let Some(jdk_home) = &req.jdk_home {
        paths.push(TypedPath::Link {
            path: Path::new(".jdk"),
            target: jdk_home,
        });
    }

    let parent_paths_to_create: HashSet<_> = req
        .output_files
        .iter()
        .chain(req.output_directories.iter())
        .filter_map(|rel_path| rel_path.as_ref().parent())
        .filter(|parent| !parent.as_os_str().is_empty())
        .collect();
    paths.extend(parent_paths_to_create.into_iter().map(TypedPath::Dir));

    let additions = DigestTrie::from_unique_paths(paths, &HashMap::new())?;

    store.merge(vec![input_digest, additions.into()]).await
}

///
/// Prepares the given sandbox directory for the given Process.
///
/// Returns true if the executable for the Process was created by the materialisation,
/// meaning that `exclusive_spawn` is required.
///
pub async fn prepare_workdir(
    workdir_path: PathBuf,
    workdir_root_path: &Path,
    req: &Process,
    materialized_input_digest: DirectoryDigest,
    store: &Store,
    named_caches: &NamedCaches,
) -> Result<bool, StoreError> {
    // Capture argv0 as the executable path so that we can test whether we have created it
    // in the sandbox.
    let maybe_executable_path = {
        let mut executable_path = PathBuf::from(&req.argv[0]);
        if executable_path.is_relative() {
            if let Some(working_directory) = &req.working_directory {
                executable_path = working_directory.as_ref().join(executable_path)
            }
            Some(workdir_path.join(executable_path))
        } else {
            None
        }
    };

    in_workunit!("setup_sandbox", Level::Debug, |_workunit| async move {
        let complete_input_digest =
            prepare_workdir_digest(req, materialized_input_digest, store, named_caches).await?;

        store
            .materialize_directory(
                workdir_path,
                workdir_root_path,
                complete_input_digest,
                &[],
                Permissions::Writable,
            )
            .await?;

        if let Some(executable_path) = maybe_executable_path {
            Ok(tokio::fs::metadata(executable_path).await.is_ok())
        } else {
            Ok(false)
        }
    })
    .await
}

///
/// Creates an optionally-cleaned-up sandbox in the given base path.
///
pub fn create_sandbox(
    executor: Executor,
    base_directory: &Path,
    description: &str,
    keep_sandboxes: KeepSandboxes,
) -> Result<AsyncDropSandbox, String> {
    let workdir = tempfile::Builder::new()
        .prefix("sandbox-")
        .tempdir_in(base_directory)
        .map_err(|err| format!("Error making tempdir for local process execution: {err:?}"))?;

    let mut sandbox = AsyncDropSandbox(executor, workdir.path().to_owned(), Some(workdir));
    if keep_sandboxes == KeepSandboxes::Always {
        sandbox.keep(description);
    }
    Ok(sandbox)
}

///
/// Dropping sandboxes can involve a lot of IO, so it is spawned to the background as a
/// blocking task.
///
#[must_use]
pub struct AsyncDropSandbox(Executor, PathBuf, Option<TempDir>);

impl AsyncDropSandbox {
    pub fn path(&self) -> &Path {
        &self.1
    }

    ///
    /// Consumes the inner TempDir without deleting it.
    ///
    pub fn keep(&mut self, description: &str) {
        if let Some(workdir) = self.2.take() {
            let preserved_path = workdir.keep();
            log::info!(
                "Preserving local process execution dir {} for {description:?}",
                preserved_path.display(),
            );
        }
    }
}

impl Drop for AsyncDropSandbox {
    fn drop(&mut self) {
        if let Some(sandbox) = self.2.take() {
            let _background_cleanup = self.0.native_spawn_blocking(|| std::mem::drop(sandbox));
        }
    }
}

///
/// Writes a `__run.sh` script into a preserved sandbox which re-executes the process, for
/// debugging.
///
pub fn setup_run_sh_script(
    sandbox_path: &Path,
    env: &std::collections::BTreeMap<String, String>,
    working_directory: &Option<RelativePath>,
    argv: &[String],
) -> Result<(), String> {
    let mut env_var_strings: Vec<String> = vec![];
    for (key, value) in env.iter() {
        let quoted_arg = bash_quote(value);
        let env_var_string = format!("{key}={quoted_arg}");
        env_var_strings.push(env_var_string);
    }
    let stringified_env_vars: String = env_var_strings.join(" ");

    let stringified_command_line: String = argv
        .iter()
        .map(|arg| bash_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");

    let maybe_working_directory = working_directory
        .as_ref()
        .map(|wd| format!("cd {}", bash_quote(&wd.display().to_string())))
        .unwrap_or_default();

    let full_script = format!(
        "#!/usr/bin/env bash\n\
     # This script may be used to replicate the sandboxed process for debugging.\n\
     cd \"$(dirname \"$0\")\"\n\
     {maybe_working_directory}\n\
     env -i {stringified_env_vars} {stringified_command_line}\n",
    );

    let full_file_path = sandbox_path.join("__run.sh");

    OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(USER_EXECUTABLE_MODE) // Executable for user, read-only for others.
        .open(&full_file_path)
        .map_err(|err| format!("Failed to create {full_file_path:?}: {err}"))?
        .write_all(full_script.as_bytes())
        .map_err(|err| format!("Failed to write {full_file_path:?}: {err}"))
}

fn bash_quote(value: &str) -> String {
    String::from_utf8(shell_quote::Bash::quote_vec(value))
        .expect("quote of UTF8 string is UTF8")
}
