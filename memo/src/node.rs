// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{Debug, Display};
use std::hash::Hash;

use async_trait::async_trait;

use crate::context::Context;

// 2^32 Nodes ought to be more than enough for anyone!
pub type EntryId = petgraph::stable_graph::NodeIndex<u32>;

///
/// A memoizable unit of work: the key of an entry in the Graph.
///
#[async_trait]
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    /// An application-defined context made available to `run` via `Context::app`.
    type Context: Send + Sync + 'static;

    type Item: Clone + Debug + Eq + Send + Sync + 'static;
    type Error: NodeError;

    async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error>;

    ///
    /// False if a Node may not be restarted while running (for example, because it has
    /// observable side effects): invalidation will not pass through such a Node, and a
    /// request for it will not be retried on invalidation.
    ///
    fn restartable(&self) -> bool {
        true
    }

    ///
    /// False if the Node's output may only be used within the Run that produced it.
    ///
    fn cacheable(&self) -> bool {
        true
    }

    /// A Node may be cacheable or not per-output (e.g. a process result under a
    /// only-cache-successes policy).
    fn cacheable_item(&self, _item: &Self::Item) -> bool {
        true
    }

    ///
    /// Renders the error produced when requesting this Node would create a cycle, given the
    /// path from the requested Node back to the requestor.
    ///
    fn cyclic_error(path: &[&Self]) -> Self::Error;
}

pub trait NodeError: Clone + Debug + Eq + Send + Sync {
    ///
    /// The error produced when a Node is invalidated out of the Graph while running.
    ///
    fn invalidated() -> Self;

    ///
    /// A generic error with the given message.
    ///
    fn generic(message: String) -> Self;
}

///
/// Counters for observing the behaviour of the Graph (primarily in tests): how many nodes
/// actually ran versus were cleaned or re-used.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub ran: usize,
    pub cleaning_succeeded: usize,
    pub cleaning_failed: usize,
}
