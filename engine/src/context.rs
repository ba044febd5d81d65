// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cas::Store;
use exec::CommandRunner;
use fnv::FnvHashSet;
use sentinel::{Invalidatable, InvalidationWatcher};
use spans::RunningWorkunit;

use crate::intrinsics::Intrinsics;
use crate::nodes::NodeKey;
use crate::session::Session;
use crate::tasks::{Rule, Tasks};

///
/// The graph Context type: requests and records dependencies for a running NodeKey.
///
pub type Context = memo::Context<NodeKey>;

///
/// The per-Session application context carried by every graph Context.
///
#[derive(Clone)]
pub struct SessionCore {
    pub core: Arc<Core>,
    pub session: Session,
}

impl SessionCore {
    pub fn new(session: Session) -> SessionCore {
        SessionCore {
            core: session.core().clone(),
            session,
        }
    }
}

///
/// A wrapper around the memoising graph which the invalidation watcher can address: changed
/// paths match the `fs_subject`s of filesystem nodes, which are cleared along with their
/// transitive dependents.
///
pub struct InvalidatableGraph(pub memo::Graph<NodeKey>);

impl Invalidatable for InvalidatableGraph {
    fn invalidate(&self, paths: &HashSet<PathBuf>, caller: &str) -> usize {
        let paths: FnvHashSet<_> = paths.iter().map(|p| p.as_path()).collect();
        let result = self.invalidate_from_roots(true, move |node| {
            node.fs_subject()
                .map(|subject| paths.contains(subject))
                .unwrap_or(false)
        });
        log::info!(
            "invalidation generated by {caller}: cleared {} and dirtied {} nodes",
            result.cleared,
            result.dirtied,
        );
        result.cleared + result.dirtied
    }
}

impl Deref for InvalidatableGraph {
    type Target = memo::Graph<NodeKey>;

    fn deref(&self) -> &memo::Graph<NodeKey> {
        &self.0
    }
}

///
/// Configuration for the execution backends.
///
pub struct ExecutionStrategyOptions {
    pub local_parallelism: usize,
    pub local_keep_sandboxes: exec::local::KeepSandboxes,
    pub graceful_shutdown_timeout: Duration,
    pub enable_docker: bool,
    /// The address of a REAPI execution service, enabling the remote backend.
    pub remote_execution_address: Option<String>,
    pub remote_store_options: remote::RemoteStoreOptions,
}

impl Default for ExecutionStrategyOptions {
    fn default() -> Self {
        ExecutionStrategyOptions {
            local_parallelism: num_cpus(),
            local_keep_sandboxes: exec::local::KeepSandboxes::Never,
            graceful_shutdown_timeout: Duration::from_secs(3),
            enable_docker: false,
            remote_execution_address: None,
            remote_store_options: remote::RemoteStoreOptions::default(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2)
}

///
/// Configuration for Core construction.
///
pub struct CoreOptions {
    pub build_root: PathBuf,
    /// The root of the persisted state layout (`lmdb_store/`, `named_caches/`, `tmp/`).
    pub cache_root: PathBuf,
    pub ignore_patterns: Vec<String>,
    pub use_gitignore: bool,
    pub local_store_options: cas::LocalOptions,
    pub execution_options: ExecutionStrategyOptions,
    /// Disabled on filesystems where native watching is unavailable: every Session start
    /// then invalidates all filesystem nodes instead.
    pub watch_filesystem: bool,
    pub local_cache: bool,
    pub process_cache_namespace: Option<String>,
}

///
/// The immutable core of the scheduler: all rule registration and backend construction
/// completes before the first Session is created.
///
pub struct Core {
    pub graph: Arc<InvalidatableGraph>,
    pub tasks: Tasks,
    pub rule_graph: solver::RuleGraph<Rule>,
    pub intrinsics: Arc<Intrinsics>,
    pub executor: pool::Executor,
    pub store: Store,
    pub command_runner: Arc<dyn CommandRunner>,
    pub vfs: vfs::PosixFS,
    pub watcher: Option<Arc<InvalidationWatcher>>,
    pub build_root: PathBuf,
    pub local_parallelism: usize,
}

impl Core {
    pub fn new(
        executor: pool::Executor,
        mut tasks: Tasks,
        options: CoreOptions,
    ) -> Result<Arc<Core>, String> {
        let intrinsics = Arc::new(Intrinsics::new());
        intrinsics.install(&mut tasks);

        let rule_graph = solver::RuleGraph::new(
            tasks.rules().clone(),
            tasks.queries().iter().cloned().collect(),
        )?;
        rule_graph.validate_reachability()?;

        let ignorer = {
            let mut gitignore_paths = Vec::new();
            if options.use_gitignore {
                gitignore_paths =
                    vfs::GitignoreStyleExcludes::gitignore_file_paths(&options.build_root);
            }
            vfs::GitignoreStyleExcludes::create_with_gitignore_files(
                options.ignore_patterns.clone(),
                gitignore_paths,
            )?
        };

        let store = Store::local_only_with_options(
            executor.clone(),
            options.cache_root.join("lmdb_store"),
            options.local_store_options.clone(),
        )?;

        let exec_root = options.cache_root.join("tmp");
        std::fs::create_dir_all(&exec_root)
            .map_err(|e| format!("Failed to create {}: {e}", exec_root.display()))?;
        let named_caches =
            exec::NamedCaches::new(options.cache_root.join("named_caches"));

        let command_runner = Self::make_command_runner(
            &executor,
            &store,
            &exec_root,
            &named_caches,
            &options,
        )?;

        let graph = Arc::new(InvalidatableGraph(memo::Graph::new(executor.clone())));

        let watcher = if options.watch_filesystem {
            let watcher = InvalidationWatcher::new(
                executor.clone(),
                options.build_root.clone(),
                ignorer.clone(),
            )?;
            watcher.start(&graph);
            Some(watcher)
        } else {
            None
        };

        let vfs = vfs::PosixFS::new(&options.build_root, ignorer, executor.clone())?;

        Ok(Arc::new(Core {
            graph,
            tasks,
            rule_graph,
            intrinsics,
            executor,
            store,
            command_runner,
            vfs,
            watcher,
            build_root: options.build_root,
            local_parallelism: options.execution_options.local_parallelism,
        }))
    }

    fn make_command_runner(
        executor: &pool::Executor,
        store: &Store,
        exec_root: &std::path::Path,
        named_caches: &exec::NamedCaches,
        options: &CoreOptions,
    ) -> Result<Arc<dyn CommandRunner>, String> {
        let exec_options = &options.execution_options;
        let local = Arc::new(exec::local::CommandRunner::new(
            store.clone(),
            executor.clone(),
            exec_root.to_owned(),
            named_caches.clone(),
            exec_options.local_keep_sandboxes,
            exec_options.graceful_shutdown_timeout,
        ));
        let workspace = Arc::new(exec::workspace::CommandRunner::new(
            store.clone(),
            executor.clone(),
            options.build_root.clone(),
            named_caches.clone(),
        ));
        let docker = if exec_options.enable_docker {
            Some(Arc::new(exec::docker::CommandRunner::new(
                store.clone(),
                executor.clone(),
                exec_root.to_owned(),
                named_caches.clone(),
                exec_options.local_keep_sandboxes,
            )?) as Arc<dyn CommandRunner>)
        } else {
            None
        };
        let remote_runner = if let Some(address) = &exec_options.remote_execution_address {
            let runner = executor.block_on(exec::remote_exec::CommandRunner::new(
                address,
                exec_options.remote_store_options.clone(),
                options.process_cache_namespace.clone(),
                store.clone(),
            ))?;
            Some(Arc::new(runner) as Arc<dyn CommandRunner>)
        } else {
            None
        };

        let router: Box<dyn CommandRunner> = Box::new(RouterRunner {
            local,
            workspace,
            docker,
            remote: remote_runner,
        });
        let bounded = exec::bounded::CommandRunner::new(router, exec_options.local_parallelism);

        let runner: Arc<dyn CommandRunner> = if options.local_cache {
            let cache = exec::cache::PersistentCache::new(
                options.cache_root.join("lmdb_store"),
                options.local_store_options.files_max_size_bytes,
                executor.clone(),
                options.local_store_options.shard_count,
            )?;
            Arc::new(exec::cache::CommandRunner::new(
                Arc::new(bounded),
                cache,
                store.clone(),
                true,
                options.process_cache_namespace.clone(),
            ))
        } else {
            Arc::new(bounded)
        };
        Ok(runner)
    }
}

///
/// Dispatches each Process to the backend its execution environment names.
///
#[derive(Debug)]
struct RouterRunner {
    local: Arc<exec::local::CommandRunner>,
    workspace: Arc<exec::workspace::CommandRunner>,
    docker: Option<Arc<dyn CommandRunner>>,
    remote: Option<Arc<dyn CommandRunner>>,
}

#[async_trait]
impl CommandRunner for RouterRunner {
    async fn run(
        &self,
        context: exec::Context,
        workunit: &mut RunningWorkunit,
        req: exec::Process,
    ) -> Result<exec::FallibleProcessResult, exec::ProcessError> {
        match &req.execution_environment.strategy {
            exec::ProcessExecutionStrategy::Local => {
                self.local.run(context, workunit, req).await
            }
            exec::ProcessExecutionStrategy::Workspace => {
                self.workspace.run(context, workunit, req).await
            }
            exec::ProcessExecutionStrategy::Docker(_) => match &self.docker {
                Some(docker) => docker.run(context, workunit, req).await,
                None => Err(exec::ProcessError::Unclassified(
                    "This process was configured to run under docker, but docker execution is \
           not enabled."
                        .to_owned(),
                )),
            },
            exec::ProcessExecutionStrategy::RemoteExecution(_) => match &self.remote {
                Some(remote) => remote.run(context, workunit, req).await,
                None => Err(exec::ProcessError::Unclassified(
                    "This process was configured to run remotely, but no remote executor is \
           configured."
                        .to_owned(),
                )),
            },
        }
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.local.shutdown().await?;
        if let Some(docker) = &self.docker {
            docker.shutdown().await?;
        }
        if let Some(remote) = &self.remote {
            remote.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("build_root", &self.build_root)
            .finish_non_exhaustive()
    }
}
