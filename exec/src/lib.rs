// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Hermetic subprocess execution: a `Process` describes an invocation over an input digest;
//! `CommandRunner` implementations execute it locally, under docker, remotely via the
//! REAPI, or directly in the workspace; wrappers add concurrency bounds and caching.

pub mod bounded;
pub mod cache;
mod children;
pub use children::ManagedChild;
pub mod docker;
pub mod local;
mod named_caches;
pub use named_caches::{CacheName, NamedCaches};
pub mod remote_exec;
#[cfg(test)]
mod tests;
pub mod workspace;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cas::{Store, StoreError};
use fingerprint::Digest;
use reapi::MessageExt;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;
use spans::{RunId, RunningWorkunit, WorkunitStore};
use vfs::{DirectoryDigest, RelativePath};

///
/// The platform a process runs on, for cache-key separation and remote scheduling.
///
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, strum_macros::EnumString, strum_macros::IntoStaticStr)]
pub enum Platform {
    #[strum(serialize = "linux_x86_64")]
    Linux_x86_64,
    #[strum(serialize = "linux_arm64")]
    Linux_arm64,
    #[strum(serialize = "macos_x86_64")]
    Macos_x86_64,
    #[strum(serialize = "macos_arm64")]
    Macos_arm64,
}

impl Platform {
    pub fn current() -> Result<Platform, String> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Ok(Platform::Linux_x86_64),
            ("linux", "aarch64") => Ok(Platform::Linux_arm64),
            ("macos", "x86_64") => Ok(Platform::Macos_x86_64),
            ("macos", "aarch64") => Ok(Platform::Macos_arm64),
            (os, arch) => Err(format!("Unsupported platform: {os} {arch}")),
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}")
    }
}

///
/// Where and how a process executes. Orthogonal to the `Process` itself: the same logical
/// process under two environments caches independently (the strategy participates in the
/// cache key).
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProcessExecutionStrategy {
    Local,
    /// Run locally, with the sandbox bind-mounted into a container with the given image.
    Docker(String),
    /// Run remotely via the REAPI, with the given platform properties.
    RemoteExecution(Vec<(String, String)>),
    /// Run against the live workspace rather than a sandbox. Cannot be cached.
    Workspace,
}

impl ProcessExecutionStrategy {
    ///
    /// The environment-relevant portion of the cache key.
    ///
    pub fn cache_value(&self) -> String {
        match self {
            Self::Local => "local_execution".to_string(),
            Self::Workspace => "workspace_execution".to_string(),
            Self::Docker(image) => format!("docker_execution: {image}"),
            Self::RemoteExecution(properties) => {
                // NB: Changing a platform property will change the cache key even if the
                // process could validly run under either set.
                format!("remote_execution: {properties:?}")
            }
        }
    }
}

///
/// The execution environment of a process: a name (from configuration), the platform it
/// will run on, and the strategy used to reach that platform.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProcessExecutionEnvironment {
    /// The name of the environment the process is running in, or None for the default.
    pub name: Option<String>,
    pub platform: Platform,
    pub strategy: ProcessExecutionStrategy,
}

impl ProcessExecutionEnvironment {
    pub fn local(platform: Platform) -> ProcessExecutionEnvironment {
        ProcessExecutionEnvironment {
            name: None,
            platform,
            strategy: ProcessExecutionStrategy::Local,
        }
    }

    pub fn execute_in_workspace(&self) -> bool {
        self.strategy == ProcessExecutionStrategy::Workspace
    }
}

///
/// Which terminal results of a process are safe to memoise, and for how long.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ProcessCacheScope {
    /// Cached in the persistent cache for successful (exit code zero) results only.
    Successful,
    /// Cached in the persistent cache for any terminal result.
    Always,
    /// Memoised in-process for the lifetime of one session only.
    PerSession,
    /// Memoised in-process for the lifetime of this daemon process only.
    PerRestart,
    /// Never memoised.
    Never,
}

impl ProcessCacheScope {
    pub fn persistent_cacheable(self, exit_code: i32) -> bool {
        match self {
            ProcessCacheScope::Always => true,
            ProcessCacheScope::Successful => exit_code == 0,
            ProcessCacheScope::PerSession
            | ProcessCacheScope::PerRestart
            | ProcessCacheScope::Never => false,
        }
    }
}

///
/// A hermetic process invocation.
///
/// The argv is executed directly: no shell expansion, and no PATH lookup unless a PATH
/// environment variable is explicitly provided.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Process {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<RelativePath>,
    pub input_digest: DirectoryDigest,
    pub output_files: BTreeSet<RelativePath>,
    pub output_directories: BTreeSet<RelativePath>,
    pub timeout: Option<Duration>,
    /// A description of the process, for the user.
    pub description: String,
    /// The level at which the process's workunit renders.
    pub level: log::Level,
    /// Named, append-only caches mounted into the sandbox at the given relative paths.
    pub append_only_caches: BTreeMap<CacheName, RelativePath>,
    /// If present, a symlink named `.jdk` points to this directory in the sandbox.
    pub jdk_home: Option<PathBuf>,
    /// If set, receives the acquired execution slot index as an environment variable.
    pub execution_slot_variable: Option<String>,
    /// The number of concurrency permits this process can make use of (0 for "one").
    pub concurrency_available: usize,
    pub cache_scope: ProcessCacheScope,
    pub execution_environment: ProcessExecutionEnvironment,
}

impl Process {
    pub fn new(argv: Vec<String>, environment: ProcessExecutionEnvironment) -> Process {
        Process {
            argv,
            env: BTreeMap::new(),
            working_directory: None,
            input_digest: vfs::EMPTY_DIRECTORY_DIGEST.clone(),
            output_files: BTreeSet::new(),
            output_directories: BTreeSet::new(),
            timeout: None,
            description: "".to_string(),
            level: log::Level::Info,
            append_only_caches: BTreeMap::new(),
            jdk_home: None,
            execution_slot_variable: None,
            concurrency_available: 0,
            cache_scope: ProcessCacheScope::Successful,
            execution_environment: environment,
        }
    }

    ///
    /// Validates the environment/cache-scope interaction: workspace processes may write to
    /// the live workspace (which the watcher observes), so memoising them would allow a
    /// stale result to survive its own side effects.
    ///
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_environment.execute_in_workspace()
            && self.cache_scope != ProcessCacheScope::Never
        {
            return Err(format!(
                "Workspace processes must use CacheScope::Never, but {:?} used {:?}.",
                self.description, self.cache_scope
            ));
        }
        Ok(())
    }
}

///
/// The result of running a process: a non-zero exit code is a valid (and cacheable) result,
/// not an error.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FallibleProcessResult {
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    pub exit_code: i32,
    pub output_directory: DirectoryDigest,
    pub metadata: ProcessResultMetadata,
}

impl FallibleProcessResult {
    /// True if this result carries the distinguished timed-out exit.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMED_OUT_EXIT_CODE
    }
}

/// The distinguished exit code for a process killed by its timeout.
pub const TIMED_OUT_EXIT_CODE: i32 = -libc::SIGTERM;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessResultSource {
    Ran,
    HitLocally,
    HitRemotely,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessResultMetadata {
    /// The time elapsed executing the process, if it ran.
    pub total_elapsed: Option<Duration>,
    /// How much time a cache hit saved, when the result came from a cache.
    pub saved_by_cache: Option<Duration>,
    pub source: ProcessResultSource,
    pub environment: ProcessExecutionEnvironment,
    /// The Run that produced this result.
    pub run_id: RunId,
}

impl ProcessResultMetadata {
    pub fn new(
        total_elapsed: Option<Duration>,
        source: ProcessResultSource,
        environment: ProcessExecutionEnvironment,
        run_id: RunId,
    ) -> ProcessResultMetadata {
        ProcessResultMetadata {
            total_elapsed,
            saved_by_cache: None,
            source,
            environment,
            run_id,
        }
    }

    pub fn update_cache_hit_elapsed(&mut self, cache_lookup_elapsed: Duration) {
        self.saved_by_cache = Some(
            self.total_elapsed
                .unwrap_or_default()
                .saturating_sub(cache_lookup_elapsed),
        );
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProcessError {
    /// A Digest was not present in either of the stores.
    MissingDigest(String, Digest),
    /// All other error types.
    Unclassified(String),
}

impl ProcessError {
    pub fn enrich(self, prefix: &str) -> Self {
        match self {
            Self::MissingDigest(s, d) => Self::MissingDigest(format!("{prefix}: {s}"), d),
            Self::Unclassified(s) => Self::Unclassified(format!("{prefix}: {s}")),
        }
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDigest(s, d) => write!(f, "{s}: {d:?}"),
            Self::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingDigest(s, d) => Self::MissingDigest(s, d),
            StoreError::Unclassified(s) => Self::Unclassified(s),
        }
    }
}

impl From<String> for ProcessError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

///
/// The session-scoped context of a process execution.
///
#[derive(Clone)]
pub struct Context {
    pub workunit_store: WorkunitStore,
    pub build_id: String,
    pub run_id: RunId,
}

impl Context {
    pub fn new(workunit_store: WorkunitStore, build_id: String, run_id: RunId) -> Context {
        Context {
            workunit_store,
            build_id,
            run_id,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Debug + Send + Sync {
    ///
    /// Executes the given Process, returning its terminal result (which may carry a
    /// non-zero exit code) or an infrastructure error.
    ///
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError>;

    /// Performs any graceful teardown the runner requires.
    async fn shutdown(&self) -> Result<(), String>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Box<T> {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        (**self).run(context, workunit, req).await
    }

    async fn shutdown(&self) -> Result<(), String> {
        (**self).shutdown().await
    }
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<T> {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        (**self).run(context, workunit, req).await
    }

    async fn shutdown(&self) -> Result<(), String> {
        (**self).shutdown().await
    }
}

///
/// Constructs the canonical REAPI `Command` and `Action` for the given Process, and the
/// Action's digest: the SHA-256 of this canonical serialisation is the process cache key.
///
/// The execution environment's name, platform, and strategy are folded into the Command's
/// platform properties so that the same logical process under two environments caches
/// independently.
///
pub fn make_execute_request(
    req: &Process,
    instance_name: Option<String>,
    cache_key_gen_version: Option<String>,
) -> Result<EntireExecuteRequest, String> {
    let mut platform_properties = Vec::new();
    platform_properties.push(remexec::platform::Property {
        name: "environment".to_owned(),
        value: req.execution_environment.strategy.cache_value(),
    });
    platform_properties.push(remexec::platform::Property {
        name: "platform".to_owned(),
        value: req.execution_environment.platform.to_string(),
    });
    if let Some(name) = &req.execution_environment.name {
        platform_properties.push(remexec::platform::Property {
            name: "environment_name".to_owned(),
            value: name.clone(),
        });
    }
    if let ProcessExecutionStrategy::RemoteExecution(properties) =
        &req.execution_environment.strategy
    {
        for (name, value) in properties {
            platform_properties.push(remexec::platform::Property {
                name: name.clone(),
                value: value.clone(),
            });
        }
    }
    if let Some(version) = cache_key_gen_version {
        platform_properties.push(remexec::platform::Property {
            name: "cache_key_gen_version".to_owned(),
            value: version,
        });
    }
    platform_properties.sort_by(|a, b| (&a.name, &a.value).cmp(&(&b.name, &b.value)));

    let mut output_paths = req
        .output_files
        .iter()
        .chain(req.output_directories.iter())
        .map(|p| {
            p.to_str()
                .map(str::to_owned)
                .ok_or_else(|| format!("Output path {p:?} was not UTF8"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    output_paths.sort();

    let command = remexec::Command {
        arguments: req.argv.clone(),
        environment_variables: req
            .env
            .iter()
            .map(|(name, value)| remexec::command::EnvironmentVariable {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        output_files: vec![],
        output_directories: vec![],
        platform: Some(remexec::Platform {
            properties: platform_properties,
        }),
        working_directory: req
            .working_directory
            .as_ref()
            .map(|wd| wd.to_str().unwrap().to_owned())
            .unwrap_or_default(),
        output_paths,
    };

    let command_digest = Digest::of_bytes(&command.to_bytes());
    let action = remexec::Action {
        command_digest: Some((&command_digest).into()),
        input_root_digest: Some(req.input_digest.as_digest().into()),
        timeout: req.timeout.map(|timeout| prost_types::Duration {
            seconds: timeout.as_secs() as i64,
            nanos: timeout.subsec_nanos() as i32,
        }),
        do_not_cache: !req.cache_scope.persistent_cacheable(0),
        salt: bytes::Bytes::new(),
        platform: None,
    };
    let action_digest = Digest::of_bytes(&action.to_bytes());

    Ok(EntireExecuteRequest {
        action,
        command,
        action_digest,
        command_digest,
        instance_name,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntireExecuteRequest {
    pub action: remexec::Action,
    pub command: remexec::Command,
    pub action_digest: Digest,
    pub command_digest: Digest,
    pub instance_name: Option<String>,
}

///
/// Translates a (local or remote) `ActionResult` back into a `FallibleProcessResult`,
/// loading any inlined stdio into the store.
///
/// `treat_tree_digest_as_directory` is true for the local cache, which stores the root
/// directory digest directly rather than a serialised REAPI `Tree` blob.
///
pub async fn populate_fallible_execution_result(
    store: Store,
    run_id: RunId,
    action_result: &remexec::ActionResult,
    treat_tree_digest_as_directory: bool,
    source: ProcessResultSource,
    environment: ProcessExecutionEnvironment,
) -> Result<FallibleProcessResult, StoreError> {
    let stdout_digest = extract_stdio_digest(
        &store,
        &action_result.stdout_digest,
        &action_result.stdout_raw,
    )
    .await?;
    let stderr_digest = extract_stdio_digest(
        &store,
        &action_result.stderr_digest,
        &action_result.stderr_raw,
    )
    .await?;

    let output_directory = match action_result.output_directories.first() {
        None => vfs::EMPTY_DIRECTORY_DIGEST.clone(),
        Some(dir) => {
            let tree_digest = reapi::require_digest(&dir.tree_digest)?;
            if treat_tree_digest_as_directory {
                store.load_directory_digest(tree_digest).await?
            } else {
                // A remote result references a serialised `Tree` blob in the CAS: fetch and
                // flatten it into persisted Directories.
                let tree: remexec::Tree = store
                    .load_file_bytes_with(tree_digest, move |bytes| {
                        prost::Message::decode(bytes)
                            .map_err(|e| format!("Invalid Tree blob {tree_digest:?}: {e:?}"))
                    })
                    .await??;
                let trie: vfs::DigestTrie = tree.try_into()?;
                store.record_digest_trie(trie, true).await?
            }
        }
    };

    let total_elapsed = action_result
        .execution_metadata
        .as_ref()
        .and_then(|metadata| {
            match (
                &metadata.worker_start_timestamp,
                &metadata.worker_completed_timestamp,
            ) {
                (Some(start), Some(end)) => timestamp_delta(start, end),
                _ => None,
            }
        });

    Ok(FallibleProcessResult {
        stdout_digest,
        stderr_digest,
        exit_code: action_result.exit_code,
        output_directory,
        metadata: ProcessResultMetadata::new(total_elapsed, source, environment, run_id),
    })
}

async fn extract_stdio_digest(
    store: &Store,
    digest: &Option<remexec::Digest>,
    raw: &bytes::Bytes,
) -> Result<Digest, StoreError> {
    match digest {
        Some(digest) => Ok(fingerprint::Digest::try_from(digest)?),
        None => Ok(store.store_file_bytes(raw.clone(), true).await?),
    }
}

fn timestamp_delta(start: &prost_types::Timestamp, end: &prost_types::Timestamp) -> Option<Duration> {
    let start = Duration::new(start.seconds.try_into().ok()?, start.nanos.try_into().ok()?);
    let end = Duration::new(end.seconds.try_into().ok()?, end.nanos.try_into().ok()?);
    end.checked_sub(start)
}
