// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};

use parking_lot::Mutex;
use spans::RunId;

use crate::entry::Generation;
use crate::node::{EntryId, Node, NodeError, Stats};
use crate::Graph;

struct InnerContext<N: Node> {
    app: N::Context,
    run_id: Mutex<RunId>,
    stats: InnerStats,
    graph: Graph<N>,
}

#[derive(Default)]
pub(crate) struct InnerStats {
    pub(crate) ran: AtomicUsize,
    pub(crate) cleaning_succeeded: AtomicUsize,
    pub(crate) cleaning_failed: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct DepState {
    pub(crate) generations: Vec<(EntryId, Generation)>,
    pub(crate) has_uncacheable_deps: bool,
}

///
/// A context passed between running Nodes, used to request and record dependencies.
///
/// A Context is always created for a particular requesting Node (or for no Node, at the
/// root), and accumulates the dependency generations observed while that Node runs.
///
pub struct Context<N: Node> {
    entry_id: Option<EntryId>,
    dep_state: Arc<Mutex<Option<DepState>>>,
    inner: Arc<InnerContext<N>>,
}

impl<N: Node> Clone for Context<N> {
    fn clone(&self) -> Self {
        Context {
            entry_id: self.entry_id,
            dep_state: self.dep_state.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<N: Node> Context<N> {
    pub(crate) fn new(graph: Graph<N>, app: N::Context, run_id: RunId) -> Self {
        Self {
            entry_id: None,
            dep_state: Arc::default(),
            inner: Arc::new(InnerContext {
                app,
                run_id: Mutex::new(run_id),
                stats: InnerStats::default(),
                graph,
            }),
        }
    }

    ///
    /// Requests the value of the given Node, recording it as a dependency of the requesting
    /// Node (if any).
    ///
    pub async fn get(&self, node: N) -> Result<N::Item, N::Error> {
        // The dependency edge and its generation are recorded by `get_inner`, which knows
        // the destination's id.
        self.inner
            .graph
            .get_inner(self.entry_id, self, node)
            .await
    }

    pub fn run_id(&self) -> RunId {
        *self.inner.run_id.lock()
    }

    pub fn new_run_id(&self) {
        *self.inner.run_id.lock() = self.inner.graph.generate_run_id();
    }

    /// The application context.
    pub fn app(&self) -> &N::Context {
        &self.inner.app
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.inner.graph
    }

    pub fn stats(&self) -> Stats {
        Stats {
            ran: self.inner.stats.ran.load(atomic::Ordering::SeqCst),
            cleaning_succeeded: self
                .inner
                .stats
                .cleaning_succeeded
                .load(atomic::Ordering::SeqCst),
            cleaning_failed: self
                .inner
                .stats
                .cleaning_failed
                .load(atomic::Ordering::SeqCst),
        }
    }

    pub(crate) fn inner_stats(&self) -> &InnerStats {
        &self.inner.stats
    }

    pub(crate) fn dep_record(
        &self,
        dep_id: EntryId,
        generation: Generation,
        uncacheable: bool,
    ) -> Result<(), N::Error> {
        let mut maybe_dep_state = self.dep_state.lock();
        if let Some(dep_state) = maybe_dep_state.as_mut() {
            dep_state.generations.push((dep_id, generation));
            dep_state.has_uncacheable_deps |= uncacheable;
            Ok(())
        } else {
            // A Node which has completed may have spawned background work which continues
            // to request dependencies.
            Err(N::Error::generic(format!(
                "Could not request additional dependencies for {:?}: the Node has completed.",
                self.entry_id
            )))
        }
    }

    ///
    /// The dependency generations which have been recorded for the requesting Node so far.
    ///
    pub(crate) fn dep_generations_so_far(&self) -> Vec<(EntryId, Generation)> {
        (*self.dep_state.lock())
            .clone()
            .map(|dep_state| dep_state.generations)
            .unwrap_or_default()
    }

    ///
    /// Completes the Context for its Node, returning the dependency generations recorded
    /// while it ran. May only be called once.
    ///
    pub(crate) fn complete(&self) -> DepState {
        self.dep_state
            .lock()
            .take()
            .unwrap_or_else(|| panic!("Node {:?} was completed multiple times.", self.entry_id))
    }

    ///
    /// Creates a clone of this Context for use by a different (requested) Node.
    ///
    /// To clone a Context for use by the _same_ Node, `Clone` is used directly.
    ///
    pub(crate) fn clone_for(&self, entry_id: EntryId) -> Self {
        Context {
            entry_id: Some(entry_id),
            dep_state: Arc::new(Mutex::new(Some(DepState::default()))),
            inner: self.inner.clone(),
        }
    }
}

impl<N: Node> Deref for Context<N> {
    type Target = N::Context;

    fn deref(&self) -> &Self::Target {
        &self.inner.app
    }
}
