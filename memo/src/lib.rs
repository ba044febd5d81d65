// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A demand-driven, memoising DAG of async computations.
//!
//! Entries are keyed by a `Node` and hold generational state: a dependent records the
//! generations of the dependencies it consumed, and a dirtied entry re-validates those
//! generations (recursively) before deciding whether to actually re-run.

mod context;
mod entry;
mod node;
#[cfg(test)]
mod tests;

pub use crate::context::Context;
pub use crate::entry::{EntryResult, Generation, RunToken};
pub use crate::node::{EntryId, Node, NodeError, Stats};

use std::collections::{HashMap as StdHashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU32};
use std::time::Duration;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use futures::future;
use log::info;
use parking_lot::Mutex;
use petgraph::Direction;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use spans::RunId;
use tokio::time::sleep;

use crate::entry::Entry;

type PGraph<N> = StableDiGraph<Entry<N>, (), u32>;

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

struct InnerGraph<N: Node> {
    nodes: HashMap<N, EntryId>,
    pg: PGraph<N>,
}

impl<N: Node> InnerGraph<N> {
    fn entry_id(&self, node: &N) -> Option<&EntryId> {
        self.nodes.get(node)
    }

    fn entry_for_id(&self, id: EntryId) -> Option<&Entry<N>> {
        self.pg.node_weight(id)
    }

    fn unsafe_entry_for_id(&self, id: EntryId) -> &Entry<N> {
        self.pg
            .node_weight(id)
            .expect("The unsafe_entry_for_id method should only be used in read-only methods!")
    }

    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }

        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    ///
    /// Returns true if the destination transitively depends on the source: adding an edge
    /// src -> dst would then create a cycle.
    ///
    fn detect_cycle(&self, src_id: EntryId, dst_id: EntryId) -> bool {
        if src_id == dst_id {
            return true;
        }
        let mut walked = self.pg.visit_map();
        let mut deque = VecDeque::new();
        deque.push_back(dst_id);
        while let Some(id) = deque.pop_front() {
            if !walked.visit(id) {
                continue;
            }
            if id == src_id {
                return true;
            }
            deque.extend(self.pg.neighbors_directed(id, Direction::Outgoing));
        }
        false
    }

    ///
    /// Computes one dependency path from dst to src (which must exist: see `detect_cycle`),
    /// for rendering a cycle error.
    ///
    fn cycle_path(&self, src_id: EntryId, dst_id: EntryId) -> Vec<N> {
        fn walk<N: Node>(
            pg: &PGraph<N>,
            walked: &mut FixedBitSet,
            position: EntryId,
            destination: EntryId,
            path: &mut Vec<N>,
        ) -> bool {
            if !walked.visit(position) {
                return false;
            }
            path.push(pg[position].node().clone());
            if position == destination {
                return true;
            }
            for adjacent in pg.neighbors_directed(position, Direction::Outgoing) {
                if walk(pg, walked, adjacent, destination, path) {
                    return true;
                }
            }
            path.pop();
            false
        }

        let mut path = Vec::new();
        let mut walked = self.pg.visit_map();
        walk(&self.pg, &mut walked, dst_id, src_id, &mut path);
        path
    }

    ///
    /// Begins a Walk from the given roots. The Walk iterates over all nodes that descend
    /// from the roots in the given direction, not necessarily in topological order.
    ///
    fn walk<F: Fn(&EntryId) -> bool>(
        &self,
        roots: VecDeque<EntryId>,
        direction: Direction,
        stop_walking_predicate: F,
    ) -> Walk<'_, N, F> {
        Walk {
            graph: self,
            direction,
            deque: roots,
            walked: self.pg.visit_map(),
            stop_walking_predicate,
        }
    }

    fn clear(&mut self) {
        for eid in self.nodes.values() {
            if let Some(entry) = self.pg.node_weight(*eid) {
                entry.clear(true);
            }
        }
    }

    ///
    /// Clears the values of all "invalidation root" Nodes (those matching the predicate,
    /// which can be invalidated for a reason other than having had their dependencies
    /// change) and dirties their transitive dependents.
    ///
    fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &mut self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        // Collect all entries that will be cleared.
        let root_ids: HashSet<_> = self
            .nodes
            .iter()
            .filter_map(|(node, &entry_id)| {
                // A NotStarted entry does not need clearing (and its dependents have either
                // already been dirtied, or never observed its value), which debounces
                // redundant invalidation.
                if predicate(node) && self.unsafe_entry_for_id(entry_id).is_started() {
                    Some(entry_id)
                } else {
                    None
                }
            })
            .collect();

        // And their transitive dependents, which will be dirtied.
        //
        // NB: Invalidation only passes "through" a Node into its dependents if the Node is
        // restartable: a non-restartable running Node holds its dependents.
        let transitive_ids: Vec<_> = self
            .walk(
                root_ids.iter().cloned().collect(),
                Direction::Incoming,
                |&entry_id| {
                    let entry = self.unsafe_entry_for_id(entry_id);
                    !entry.node().restartable() && entry.is_running()
                },
            )
            .filter(|eid| !root_ids.contains(eid))
            .collect();

        let invalidation_result = InvalidationResult {
            cleared: root_ids.len(),
            dirtied: transitive_ids.len(),
        };

        // With no roots, nothing is invalidated: return early to avoid scanning all edges.
        if root_ids.is_empty() {
            return invalidation_result;
        }

        // Clear roots and remove their outbound edges.
        for &id in &root_ids {
            if let Some(entry) = self.pg.node_weight(id) {
                entry.clear(false);
            }
        }
        let edges_to_remove: Vec<_> = root_ids
            .iter()
            .flat_map(|&id| {
                self.pg
                    .edges_directed(id, Direction::Outgoing)
                    .map(|e| e.id())
            })
            .collect();
        for edge_id in edges_to_remove {
            self.pg.remove_edge(edge_id);
        }

        // Dirty transitive entries, but do not clear their output edges: if the entry can
        // be cleaned, all edges are preserved; if it cannot, they are cleared when cleaning
        // fails.
        for id in &transitive_ids {
            if let Some(entry) = self.pg.node_weight(*id) {
                if log_dirtied {
                    log::info!("Dirtying {}", entry.node());
                }
                entry.dirty();
            }
        }

        invalidation_result
    }

    ///
    /// Removes all nodes which are not reachable from the given roots, returning the number
    /// removed. Used to bound graph growth between sessions.
    ///
    fn retain_reachable(&mut self, roots: &[N]) -> usize {
        let root_ids = roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .cloned()
            .collect();
        let reachable: HashSet<_> = self.walk(root_ids, Direction::Outgoing, |_| false).collect();

        let before = self.pg.node_count();
        self.pg.retain_nodes(|_, id| reachable.contains(&id));
        self.nodes.retain(|_, id| reachable.contains(id));
        before - self.pg.node_count()
    }

    fn live_reachable<'g>(
        &'g self,
        roots: &[N],
        context: &Context<N>,
    ) -> impl Iterator<Item = (&'g N, N::Item)> + 'g {
        let root_ids = roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .cloned()
            .collect();
        self.live_internal(
            self.walk(root_ids, Direction::Outgoing, |_| false)
                .collect(),
            context.clone(),
        )
    }

    fn live<'g>(&'g self, context: &Context<N>) -> impl Iterator<Item = (&'g N, N::Item)> + 'g {
        self.live_internal(self.pg.node_indices().collect(), context.clone())
    }

    fn live_internal(
        &self,
        entryids: Vec<EntryId>,
        context: Context<N>,
    ) -> impl Iterator<Item = (&N, N::Item)> + '_ {
        entryids
            .into_iter()
            .filter_map(move |eid| self.entry_for_id(eid))
            .filter_map(move |entry| entry.peek(&context).map(|i| (entry.node(), i)))
    }
}

///
/// A DAG (enforced on mutation) of memoised Entries.
///
pub struct Graph<N: Node> {
    inner: Arc<Mutex<InnerGraph<N>>>,
    invalidation_delay: Duration,
    run_id_generator: Arc<AtomicU32>,
    executor: pool::Executor,
}

impl<N: Node> Clone for Graph<N> {
    fn clone(&self) -> Self {
        Graph {
            inner: self.inner.clone(),
            invalidation_delay: self.invalidation_delay,
            run_id_generator: self.run_id_generator.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<N: Node> Graph<N> {
    pub fn new(executor: pool::Executor) -> Graph<N> {
        Self::new_with_invalidation_delay(executor, Duration::from_millis(500))
    }

    pub fn new_with_invalidation_delay(
        executor: pool::Executor,
        invalidation_delay: Duration,
    ) -> Graph<N> {
        Graph {
            inner: Arc::new(Mutex::new(InnerGraph {
                nodes: HashMap::default(),
                pg: StableDiGraph::default(),
            })),
            invalidation_delay,
            run_id_generator: Arc::default(),
            executor,
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len()
    }

    pub(crate) fn executor(&self) -> &pool::Executor {
        &self.executor
    }

    pub fn generate_run_id(&self) -> RunId {
        RunId(self.run_id_generator.fetch_add(1, atomic::Ordering::SeqCst))
    }

    ///
    /// Creates a Context for a fresh external request scope (a "Run") against this Graph.
    ///
    pub fn context(&self, app: N::Context) -> Context<N> {
        let run_id = self.generate_run_id();
        Context::new(self.clone(), app, run_id)
    }

    pub fn context_with_run_id(&self, app: N::Context, run_id: RunId) -> Context<N> {
        Context::new(self.clone(), app, run_id)
    }

    pub(crate) async fn get_inner(
        &self,
        src_id: Option<EntryId>,
        context: &Context<N>,
        dst_node: N,
    ) -> Result<N::Item, N::Error> {
        // Compute information about the dst under the Graph lock, and then release it.
        let (dst_retry, entry, entry_id) = {
            let mut inner = self.inner.lock();

            let dst_id = inner.ensure_entry(dst_node);
            let dst_retry = if let Some(src_id) = src_id {
                // I4/I6 hygiene: the graph must remain acyclic. Detect the cycle before the
                // edge is inserted, and fail the request permanently (but un-memoised: a
                // different requestor may legally compute the same dst).
                if inner.detect_cycle(src_id, dst_id) {
                    let path = inner.cycle_path(src_id, dst_id);
                    let path_refs = path.iter().collect::<Vec<_>>();
                    return Err(N::cyclic_error(&path_refs));
                }
                inner.pg.update_edge(src_id, dst_id, ());

                // Retry the dst if the src is not restartable: a non-restartable src only
                // runs once, so invalidation does not pass through it and the dst must be
                // re-requested here instead.
                !inner.entry_for_id(src_id).unwrap().node().restartable()
            } else {
                // An external request: always retry on invalidation.
                true
            };

            let dst_entry = inner.entry_for_id(dst_id).cloned().unwrap();
            (dst_retry, dst_entry, dst_id)
        };

        let (res, generation, uncacheable) = if dst_retry {
            // Retry the dst a bounded-by-politeness number of times to handle invalidation.
            loop {
                let (res, generation, uncacheable) =
                    entry.get_node_result(context, entry_id).await;
                match res {
                    Err(err) if err == N::Error::invalidated() => {
                        let node = {
                            let inner = self.inner.lock();
                            inner.unsafe_entry_for_id(entry_id).node().clone()
                        };
                        info!(
                            "Filesystem changed during run: retrying `{node}` in {:?}...",
                            self.invalidation_delay
                        );
                        sleep(self.invalidation_delay).await;
                    }
                    res => break (res, generation, uncacheable),
                }
            }
        } else {
            entry.get_node_result(context, entry_id).await
        };

        if src_id.is_some() {
            context.dep_record(entry_id, generation, uncacheable)?;
        }
        res
    }

    ///
    /// Requests the given dst Node as an external root: memoised like any other request,
    /// and retried on invalidation until it completes.
    ///
    pub async fn create(&self, node: N, context: &Context<N>) -> Result<N::Item, N::Error> {
        self.get_inner(None, context, node).await
    }

    ///
    /// Compares the generations of the recorded dependencies of the given Entry against
    /// their current values (re-computing or cleaning them first if necessary). Succeeds
    /// with the uncacheable-deps flag if all dependencies are unchanged; otherwise clears
    /// the Entry's dependency edges and fails.
    ///
    pub(crate) async fn attempt_cleaning(
        &self,
        entry_id: EntryId,
        run_token: RunToken,
        previous_dep_generations: &[(EntryId, Generation)],
        context: &Context<N>,
    ) -> Result<bool, ()> {
        let generation_checks = {
            let inner = self.inner.lock();
            previous_dep_generations
                .iter()
                .map(|&(dep_id, previous_dep_generation)| {
                    let entry = inner.entry_for_id(dep_id).cloned();
                    let context = context.clone();
                    async move {
                        let dep_entry = entry.ok_or(())?;
                        let (res, generation, uncacheable) =
                            dep_entry.get_node_result(&context, dep_id).await;
                        res.map_err(|_| ())?;
                        if generation == previous_dep_generation {
                            Ok(uncacheable)
                        } else {
                            // Failing fast here (via try_join_all) cancels the remaining
                            // extraneous cleaning work.
                            Err(())
                        }
                    }
                })
                .collect::<Vec<_>>()
        };

        match future::try_join_all(generation_checks).await {
            Ok(uncacheables) => Ok(uncacheables.into_iter().any(|u| u)),
            Err(()) => {
                // At least one dependency changed: this Entry is not cleanable, so its
                // recorded dependency edges no longer describe its next run. Clear them.
                let mut inner = self.inner.lock();
                let matched = inner
                    .entry_for_id(entry_id)
                    .map(|entry| entry.cleaning_failed(run_token).is_ok())
                    .unwrap_or(false);
                if matched {
                    let edge_ids: Vec<_> = inner
                        .pg
                        .edges_directed(entry_id, Direction::Outgoing)
                        .map(|e| e.id())
                        .collect();
                    for edge_id in edge_ids {
                        inner.pg.remove_edge(edge_id);
                    }
                }
                Err(())
            }
        }
    }

    ///
    /// Clears the state of all Nodes in the Graph.
    ///
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.clear()
    }

    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let mut inner = self.inner.lock();
        inner.invalidate_from_roots(log_dirtied, predicate)
    }

    pub fn invalidate_all(&self, caller: &str) -> InvalidationResult {
        log::debug!("Invalidating all paths for: {caller}");
        let mut inner = self.inner.lock();
        inner.invalidate_from_roots(false, |_| true)
    }

    ///
    /// Removes Nodes which are not reachable from the given roots. Callers (Sessions) hold
    /// strong references to the roots they have requested, which prevents mid-run
    /// collection.
    ///
    pub fn retain_reachable(&self, roots: &[N]) -> usize {
        let mut inner = self.inner.lock();
        inner.retain_reachable(roots)
    }

    pub fn visit_live_reachable(
        &self,
        roots: &[N],
        context: &Context<N>,
        mut f: impl FnMut(&N, N::Item),
    ) {
        let inner = self.inner.lock();
        for (n, v) in inner.live_reachable(roots, context) {
            f(n, v);
        }
    }

    pub fn visit_live(&self, context: &Context<N>, mut f: impl FnMut(&N, N::Item)) {
        let inner = self.inner.lock();
        for (n, v) in inner.live(context) {
            f(n, v);
        }
    }

    ///
    /// Renders the reachable portion of the graph as DOT for debugging.
    ///
    pub fn visualize(&self, roots: &[N], context: &Context<N>) -> String {
        let inner = self.inner.lock();
        let root_ids = roots
            .iter()
            .filter_map(|node| inner.entry_id(node))
            .cloned()
            .collect();
        let included: HashSet<_> = inner
            .walk(root_ids, Direction::Outgoing, |_| false)
            .collect();

        let mut out = String::from("digraph plans {\n");
        let mut edges: StdHashMap<EntryId, Vec<EntryId>> = StdHashMap::new();
        for id in &included {
            edges.insert(
                *id,
                inner
                    .pg
                    .neighbors_directed(*id, Direction::Outgoing)
                    .collect(),
            );
        }
        for (src, dsts) in edges {
            let src_str = inner.pg[src].format(context);
            for dst in dsts {
                out.push_str(&format!(
                    "  \"{}\" -> \"{}\"\n",
                    src_str,
                    inner.pg[dst].format(context)
                ));
            }
        }
        out.push_str("}\n");
        out
    }
}

///
/// The state of a walk through a Graph, with the same lifetime as the Graph itself.
///
struct Walk<'a, N: Node, F>
where
    F: Fn(&EntryId) -> bool,
{
    graph: &'a InnerGraph<N>,
    direction: Direction,
    deque: VecDeque<EntryId>,
    walked: FixedBitSet,
    stop_walking_predicate: F,
}

impl<'a, N: Node + 'a, F: Fn(&EntryId) -> bool> Iterator for Walk<'a, N, F> {
    type Item = EntryId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.deque.pop_front() {
            // Visit this node and its neighbors unless it was already visited, or the
            // stop-walking predicate matches (which selectively bounds invalidation at,
            // for example, non-restartable nodes).
            if !self.walked.visit(id) || (self.stop_walking_predicate)(&id) {
                continue;
            }

            self.deque
                .extend(self.graph.pg.neighbors_directed(id, self.direction));
            return Some(id);
        }

        None
    }
}

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}
