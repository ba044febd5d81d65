// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future;
use spans::Level;

use crate::context::Core;
use crate::nodes::{NodeKey, NodeOutput, Root};
use crate::session::Session;
use crate::types::{Failure, Params, TypeId, Value};

///
/// The queries of one `execute` call: output types plus root parameter values.
///
#[derive(Default)]
pub struct ExecutionRequest {
    pub roots: Vec<(TypeId, Params)>,
    /// A timeout for polling-style callers; None waits until completion or cancellation.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum ExecutionTermination {
    /// The Session was cancelled (exit code 130 at the embedder boundary).
    KeyboardInterrupt,
    /// The timeout of the request elapsed.
    PollTimeout,
    /// An unrecoverable internal error (exit code 2 at the embedder boundary).
    Fatal(String),
}

/// The interval at which long-running leaves are logged while a request runs.
const STRAGGLER_LOGGING_INTERVAL: Duration = Duration::from_secs(30);
const STRAGGLER_THRESHOLD: Duration = Duration::from_secs(60);

///
/// The runtime face of the engine: drives rule execution for Sessions against the
/// pre-compiled rule graph and the memoising node graph.
///
pub struct Scheduler {
    pub core: Arc<Core>,
}

impl Scheduler {
    pub fn new(core: Arc<Core>) -> Scheduler {
        Scheduler { core }
    }

    ///
    /// Marks the given workspace-relative paths as changed, dirtying the affected subgraph.
    ///
    pub fn invalidate_paths(&self, paths: &HashSet<PathBuf>) -> usize {
        use sentinel::Invalidatable;
        self.core.graph.invalidate(paths, "external")
    }

    ///
    /// Marks all filesystem nodes as changed: used on Session start when the watcher is
    /// disabled or has failed (always-invalidate mode).
    ///
    pub fn invalidate_all_paths(&self) -> usize {
        self.core
            .graph
            .invalidate_from_roots(false, |node| node.fs_subject().is_some())
            .cleared
    }

    ///
    /// True if the watcher is running; false if the scheduler is responsible for
    /// always-invalidate behaviour.
    ///
    pub async fn is_valid(&self) -> Result<(), String> {
        match &self.core.watcher {
            Some(watcher) => watcher.is_valid().await,
            None => Ok(()),
        }
    }

    ///
    /// Drains started/completed workunits at or above the given level.
    ///
    pub fn poll_workunits(
        &self,
        session: &Session,
        max_level: Level,
    ) -> (Vec<spans::Workunit>, Vec<spans::Workunit>) {
        session.workunit_store().latest_workunits(max_level)
    }

    ///
    /// Executes the given request's queries against the session, returning one result per
    /// root in the order declared.
    ///
    /// Cancelling the session's latch causes a prompt `KeyboardInterrupt` termination; any
    /// in-flight processes are killed as their nodes are dropped.
    ///
    pub fn execute(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Result<Vec<Result<Value, Failure>>, ExecutionTermination> {
        debug_assert!(Arc::ptr_eq(&self.core, session.core()));

        // When the watcher is unavailable, every request begins by assuming all filesystem
        // nodes are stale.
        if self.core.watcher.is_none() {
            self.invalidate_all_paths();
        }

        let roots = request
            .roots
            .iter()
            .map(|(product, params)| {
                NodeKey::Root(Box::new(Root {
                    product: *product,
                    params: params.clone(),
                }))
            })
            .collect::<Vec<_>>();
        session.roots_extend(roots.clone());
        session.workunit_store().init_thread_state(None);

        let context = session.graph_context();
        let core = self.core.clone();
        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);

        self.core.executor.block_on(async move {
            let execution = future::join_all(
                roots
                    .into_iter()
                    .map(|root| {
                        let context = context.clone();
                        let core = core.clone();
                        async move {
                            let result = core.graph.create(root, &context).await;
                            result.and_then(|output| match output {
                                NodeOutput::Value(value) => Ok(value),
                                output => Err(crate::types::throw(format!(
                                    "Unexpected root output: {output:?}"
                                ))),
                            })
                        }
                    })
                    .collect::<Vec<_>>(),
            );
            let mut execution = execution.boxed();

            let mut straggler_deadline = Instant::now() + STRAGGLER_LOGGING_INTERVAL;
            loop {
                let straggler_sleep = tokio::time::sleep_until(straggler_deadline.into());
                tokio::select! {
                  _ = session.cancelled() => {
                    // Cancelled: in-flight work is dropped with the futures above, and
                    // running processes are killed by their Drop implementations.
                    return Err(ExecutionTermination::KeyboardInterrupt);
                  }
                  _ = straggler_sleep => {
                    straggler_deadline = Instant::now() + STRAGGLER_LOGGING_INTERVAL;
                    let stragglers = session
                      .workunit_store()
                      .straggling_workunits(STRAGGLER_THRESHOLD);
                    for (duration, description) in stragglers {
                      log::info!(
                        "Long running tasks: {} ({})",
                        description,
                        spans::format_workunit_duration_ms(duration.as_millis()),
                      );
                    }
                    if let Some(deadline) = deadline {
                      if Instant::now() >= deadline {
                        return Err(ExecutionTermination::PollTimeout);
                      }
                    }
                  }
                  results = &mut execution => {
                    return Ok(results);
                  }
                }
            }
        })
    }

    ///
    /// Garbage collects nodes unreachable from any live Session root, bounding graph growth
    /// between sessions.
    ///
    pub fn garbage_collect_graph(&self, live_sessions: &[Session]) -> usize {
        let roots = live_sessions
            .iter()
            .flat_map(|session| session.roots_nodes())
            .collect::<Vec<_>>();
        self.core.graph.retain_reachable(&roots)
    }

    /// Renders the node graph reachable from the session's roots, for debugging.
    pub fn visualize(&self, session: &Session) -> String {
        let context = session.graph_context();
        self.core
            .graph
            .visualize(&session.roots_nodes(), &context)
    }
}
