// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Context, Graph, Node, NodeError};

///
/// A test Node which requests the dependencies registered for its id in the TApp, and sums
/// their outputs with a per-id salt value.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct TNode {
    id: usize,
    cacheable: bool,
}

impl TNode {
    fn new(id: usize) -> TNode {
        TNode {
            id,
            cacheable: true,
        }
    }

    fn uncacheable(id: usize) -> TNode {
        TNode {
            id,
            cacheable: false,
        }
    }
}

impl fmt::Display for TNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TNode({})", self.id)
    }
}

struct TApp {
    edges: Mutex<HashMap<usize, Vec<usize>>>,
    salts: Mutex<HashMap<usize, usize>>,
    runs: Mutex<Vec<usize>>,
    delay_for: Mutex<HashMap<usize, Duration>>,
}

impl TApp {
    fn new(edges: Vec<(usize, Vec<usize>)>) -> Arc<TApp> {
        Arc::new(TApp {
            edges: Mutex::new(edges.into_iter().collect()),
            salts: Mutex::default(),
            runs: Mutex::default(),
            delay_for: Mutex::default(),
        })
    }

    /// A linear chain: id N depends on N-1, down to 0.
    fn chain(len: usize) -> Arc<TApp> {
        TApp::new(
            (0..len)
                .map(|id| (id, if id == 0 { vec![] } else { vec![id - 1] }))
                .collect(),
        )
    }

    fn set_salt(&self, id: usize, salt: usize) {
        self.salts.lock().insert(id, salt);
    }

    fn runs(&self) -> Vec<usize> {
        self.runs.lock().clone()
    }

    fn clear_runs(&self) {
        self.runs.lock().clear()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum TError {
    Invalidated,
    Cyclic(Vec<usize>),
    Generic(String),
}

impl NodeError for TError {
    fn invalidated() -> Self {
        TError::Invalidated
    }

    fn generic(message: String) -> Self {
        TError::Generic(message)
    }
}

#[async_trait]
impl Node for TNode {
    type Context = Arc<TApp>;
    type Item = usize;
    type Error = TError;

    async fn run(self, context: Context<TNode>) -> Result<usize, TError> {
        let (deps, delay) = {
            let app = context.app();
            app.runs.lock().push(self.id);
            let deps = app.edges.lock().get(&self.id).cloned().unwrap_or_default();
            let delay = app.delay_for.lock().get(&self.id).cloned();
            (deps, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut total = context.app().salts.lock().get(&self.id).cloned().unwrap_or(0);
        for dep in deps {
            total += context
                .get(TNode {
                    id: dep,
                    cacheable: true,
                })
                .await?;
        }
        Ok(total + self.id)
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn cyclic_error(path: &[&TNode]) -> TError {
        TError::Cyclic(path.iter().map(|n| n.id).collect())
    }
}

fn empty_graph() -> Graph<TNode> {
    Graph::new_with_invalidation_delay(pool::Executor::new(), Duration::from_millis(10))
}

#[tokio::test]
async fn create_computes_transitive_deps() {
    let _logger = env_logger::try_init();
    let graph = empty_graph();
    let app = TApp::chain(3);
    let context = graph.context(app.clone());

    let result = graph.create(TNode::new(2), &context).await;
    assert_eq!(result, Ok(3));
    // Bottom-up execution order.
    assert_eq!(app.runs(), vec![2, 1, 0]);
}

#[tokio::test]
async fn identical_requests_are_memoised() {
    let graph = empty_graph();
    let app = TApp::chain(3);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(2), &context).await, Ok(3));
    app.clear_runs();

    // The same request again runs nothing.
    assert_eq!(graph.create(TNode::new(2), &context).await, Ok(3));
    assert_eq!(app.runs(), Vec::<usize>::new());
    assert_eq!(context.stats().ran, 3);
}

#[tokio::test]
async fn at_most_one_concurrent_execution_per_key() {
    let graph = empty_graph();
    let app = TApp::chain(2);
    app.delay_for
        .lock()
        .insert(0, Duration::from_millis(100));
    let context = graph.context(app.clone());

    // Race many requests for the same key while the leaf is deliberately slow.
    let requests = (0..16)
        .map(|_| graph.create(TNode::new(1), &context))
        .collect::<Vec<_>>();
    for result in futures::future::join_all(requests).await {
        assert_eq!(result, Ok(1));
    }
    // Each node ran exactly once.
    let mut runs = app.runs();
    runs.sort();
    assert_eq!(runs, vec![0, 1]);
}

#[tokio::test]
async fn invalidation_of_unrelated_node_leaves_clean_set_unchanged() {
    let graph = empty_graph();
    let app = TApp::new(vec![(0, vec![]), (1, vec![0]), (10, vec![])]);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    assert_eq!(graph.create(TNode::new(10), &context).await, Ok(10));
    app.clear_runs();

    // Invalidating an unrelated node does not disturb the other subgraph.
    let result = graph.invalidate_from_roots(false, |n| n.id == 10);
    assert_eq!(result.cleared, 1);
    assert_eq!(result.dirtied, 0);

    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    assert_eq!(app.runs(), Vec::<usize>::new());
}

#[tokio::test]
async fn dirtied_nodes_clean_without_rerunning_when_deps_are_unchanged() {
    let graph = empty_graph();
    let app = TApp::chain(3);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(2), &context).await, Ok(3));
    app.clear_runs();

    // Invalidate the leaf without changing its output: the leaf re-runs, and because its
    // generation does not change, its dependents are cleaned rather than re-run.
    graph.invalidate_from_roots(false, |n| n.id == 0);
    assert_eq!(graph.create(TNode::new(2), &context).await, Ok(3));
    assert_eq!(app.runs(), vec![0]);
}

#[tokio::test]
async fn dirtied_nodes_rerun_when_deps_changed() {
    let graph = empty_graph();
    let app = TApp::chain(3);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(2), &context).await, Ok(3));
    app.clear_runs();

    // Change the leaf's output and invalidate it: everything re-runs (no stale reads).
    app.set_salt(0, 100);
    graph.invalidate_from_roots(false, |n| n.id == 0);
    assert_eq!(graph.create(TNode::new(2), &context).await, Ok(103));
    let mut runs = app.runs();
    runs.sort();
    assert_eq!(runs, vec![0, 1, 2]);
}

#[tokio::test]
async fn cycles_fail_with_the_path() {
    let graph = empty_graph();
    let app = TApp::new(vec![(0, vec![1]), (1, vec![0])]);
    let context = graph.context(app.clone());

    match graph.create(TNode::new(0), &context).await {
        Err(TError::Cyclic(path)) => {
            assert!(!path.is_empty(), "expected a non-empty cycle path");
        }
        other => panic!("Expected a cycle error, got: {other:?}"),
    }
}

#[tokio::test]
async fn cycle_errors_are_not_memoised() {
    let graph = empty_graph();
    let app = TApp::new(vec![(0, vec![1]), (1, vec![0])]);
    let context = graph.context(app.clone());

    assert!(matches!(
        graph.create(TNode::new(0), &context).await,
        Err(TError::Cyclic(_))
    ));

    // Break the cycle, and re-request: the same key must now compute successfully.
    app.edges.lock().insert(1, vec![]);
    graph.invalidate_from_roots(false, |_| true);
    assert_eq!(graph.create(TNode::new(0), &context).await, Ok(1));
}

#[tokio::test]
async fn uncacheable_nodes_rerun_per_run() {
    let graph = empty_graph();
    let app = TApp::new(vec![(0, vec![])]);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::uncacheable(0), &context).await, Ok(0));
    assert_eq!(graph.create(TNode::uncacheable(0), &context).await, Ok(0));
    // Within one run, the value is re-used.
    assert_eq!(app.runs(), vec![0]);

    // In a new run, it re-runs.
    context.new_run_id();
    assert_eq!(graph.create(TNode::uncacheable(0), &context).await, Ok(0));
    assert_eq!(app.runs(), vec![0, 0]);
}

#[tokio::test]
async fn invalidate_all_dirties_every_node() {
    let graph = empty_graph();
    let app = TApp::chain(2);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    let result = graph.invalidate_all("tests");
    assert_eq!(result.cleared, 2);
}

#[tokio::test]
async fn retain_reachable_drops_orphans() {
    let graph = empty_graph();
    let app = TApp::new(vec![(0, vec![]), (1, vec![0]), (10, vec![])]);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    assert_eq!(graph.create(TNode::new(10), &context).await, Ok(10));
    assert_eq!(graph.len(), 3);

    let removed = graph.retain_reachable(&[TNode::new(1)]);
    assert_eq!(removed, 1);
    assert_eq!(graph.len(), 2);

    // The retained subgraph is still memoised.
    app.clear_runs();
    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    assert_eq!(app.runs(), Vec::<usize>::new());
}

#[tokio::test]
async fn generations_propagate_only_on_change() {
    let graph = empty_graph();
    let app = TApp::chain(2);
    let context = graph.context(app.clone());

    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    let stats_before = context.stats();

    // Re-validate after an invalidation which does not change output: one clean succeeds.
    graph.invalidate_from_roots(false, |n| n.id == 0);
    assert_eq!(graph.create(TNode::new(1), &context).await, Ok(1));
    let stats_after = context.stats();
    assert_eq!(stats_after.cleaning_succeeded, stats_before.cleaning_succeeded + 1);
}
