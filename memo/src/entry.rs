// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::mem;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use spans::RunId;
use syncutil::{AsyncValue, AsyncValueReceiver, AsyncValueSender};

use crate::context::{Context, DepState};
use crate::node::{EntryId, Node, NodeError};
use crate::test_trace_log;

///
/// A token that uniquely identifies one run of a Node. When a run completes, if the current
/// RunToken of its Node no longer matches (because the Node was cleared in the interim), the
/// work is discarded.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunToken(u32);

impl RunToken {
    pub fn initial() -> RunToken {
        RunToken(0)
    }

    fn next(self) -> RunToken {
        RunToken(self.0 + 1)
    }
}

///
/// A counter that is incremented whenever a Node's output value has (or might have) changed.
/// A dependent records the generation it consumed; comparing recorded generations against
/// current ones determines whether the dependent's inputs have changed.
///
/// Unlike the RunToken (which increments for every re-run), the Generation only increments
/// when the output actually changes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(u32);

impl Generation {
    pub fn initial() -> Generation {
        Generation(0)
    }

    fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

#[derive(Debug)]
pub(crate) enum NodeInterrupt {
    Dirtied,
}

///
/// A computed value, along with the constraints on where it may be re-used.
///
#[derive(Clone, Debug)]
pub enum EntryResult<N: Node> {
    /// Immediately readable by any consumer.
    Clean(N::Item),
    /// A consumer must first check whether the Node's dependencies still have the values
    /// they had when this was computed; if so, the value moves back to Clean.
    Dirty(N::Item),
    /// Usable only within the Run that computed it, and recomputed in any other Run.
    Uncacheable(N::Item, RunId),
    /// Computed from an Uncacheable dependency: Clean within the producing Run, and Dirty
    /// outside of it.
    UncacheableDependencies(N::Item, RunId),
}

impl<N: Node> EntryResult<N> {
    fn new(
        item: N::Item,
        context: &Context<N>,
        cacheable: bool,
        has_uncacheable_deps: bool,
    ) -> EntryResult<N> {
        if !cacheable {
            EntryResult::Uncacheable(item, context.run_id())
        } else if has_uncacheable_deps {
            EntryResult::UncacheableDependencies(item, context.run_id())
        } else {
            EntryResult::Clean(item)
        }
    }

    fn is_clean(&self, context: &Context<N>) -> bool {
        match self {
            EntryResult::Clean(..) => true,
            EntryResult::Uncacheable(_, run_id)
            | EntryResult::UncacheableDependencies(_, run_id) => context.run_id() == *run_id,
            EntryResult::Dirty(..) => false,
        }
    }

    fn has_uncacheable_deps(&self) -> bool {
        match self {
            EntryResult::Uncacheable(_, _) | EntryResult::UncacheableDependencies(_, _) => true,
            EntryResult::Clean(..) | EntryResult::Dirty(..) => false,
        }
    }

    fn peek(&self, context: &Context<N>) -> Option<N::Item> {
        if self.is_clean(context) {
            Some(self.as_ref().clone())
        } else {
            None
        }
    }

    /// If the value is in a clean state, mark it Dirty.
    fn dirty(&mut self) {
        match self {
            EntryResult::Clean(v)
            | EntryResult::UncacheableDependencies(v, _)
            | EntryResult::Uncacheable(v, _) => {
                *self = EntryResult::Dirty(v.clone());
            }
            EntryResult::Dirty(_) => {}
        }
    }

    /// Assert that the value is in a dirty state, and move it to a clean one.
    fn clean(&mut self, context: &Context<N>, cacheable: bool, has_uncacheable_deps: bool) {
        let value = match self {
            EntryResult::Dirty(value) => value.clone(),
            EntryResult::UncacheableDependencies(value, _) => value.clone(),
            x => unreachable!("A node in state {:?} should not have been cleaned.", x),
        };

        *self = EntryResult::new(value, context, cacheable, has_uncacheable_deps);
    }
}

impl<N: Node> AsRef<N::Item> for EntryResult<N> {
    fn as_ref(&self) -> &N::Item {
        match self {
            EntryResult::Clean(v) => v,
            EntryResult::Dirty(v) => v,
            EntryResult::Uncacheable(v, _) => v,
            EntryResult::UncacheableDependencies(v, _) => v,
        }
    }
}

/// (result, the generation it was produced at, whether it had uncacheable deps)
pub(crate) type NodeResult<N> = (
    Result<<N as Node>::Item, <N as Node>::Error>,
    Generation,
    bool,
);

#[derive(Debug)]
pub(crate) enum EntryState<N: Node> {
    // A node that was either explicitly cleared, or has not yet started running. There is
    // no need for a dirty bit: the RunToken is either initial, or was incremented when the
    // node was cleared.
    //
    // The previous_result is _not_ a valid value for this Entry: it is preserved only in
    // order to compute the generation value the next time the Node runs.
    NotStarted {
        run_token: RunToken,
        generation: Generation,
        previous_result: Option<EntryResult<N>>,
    },
    // A running node, which will re-run rather than completing if it is marked dirty.
    //
    // Holds an AsyncValue whose work is cancelled if all receivers go away, or if the
    // AsyncValue itself is dropped.
    Running {
        run_token: RunToken,
        pending_value: AsyncValue<NodeResult<N>, NodeInterrupt>,
        generation: Generation,
        previous_result: Option<EntryResult<N>>,
        is_cleaning: bool,
    },
    // A node that has completed, and then possibly been marked dirty. Dirtying does not
    // eagerly re-execute: the node stays Completed until a caller requests it again.
    Completed {
        run_token: RunToken,
        generation: Generation,
        result: EntryResult<N>,
        dep_generations: Vec<(EntryId, Generation)>,
    },
}

impl<N: Node> EntryState<N> {
    fn initial() -> EntryState<N> {
        EntryState::NotStarted {
            run_token: RunToken::initial(),
            generation: Generation::initial(),
            previous_result: None,
        }
    }
}

///
/// An Entry in the Graph: a Node key plus its current run state.
///
#[derive(Debug)]
pub(crate) struct Entry<N: Node> {
    node: Arc<N>,
    state: Arc<Mutex<EntryState<N>>>,
}

impl<N: Node> Clone for Entry<N> {
    fn clone(&self) -> Self {
        Entry {
            node: self.node.clone(),
            state: self.state.clone(),
        }
    }
}

impl<N: Node> Entry<N> {
    ///
    /// Creates an Entry without starting it. This indirection exists because the EntryId of
    /// an Entry is not known until it has been stored in the Graph, and the EntryId is
    /// needed to run it.
    ///
    pub(crate) fn new(node: N) -> Entry<N> {
        Entry {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::initial())),
        }
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub(crate) fn cacheable_with_output(&self, output: Option<&N::Item>) -> bool {
        let output_cacheable = match output {
            Some(item) => self.node.cacheable_item(item),
            None => false,
        };
        output_cacheable && self.node.cacheable()
    }

    ///
    /// If the Future for this Node has already completed, returns a clone of its result.
    ///
    pub fn peek(&self, context: &Context<N>) -> Option<N::Item> {
        let state = self.state.lock();
        match *state {
            EntryState::Completed { ref result, .. } => result.peek(context),
            _ => None,
        }
    }

    ///
    /// Spawns the execution of the node onto the Graph's executor, which will execute
    /// outside of the Graph and Entry locks and call back to the Entry to complete.
    ///
    fn spawn_node_execution(
        context_factory: &Context<N>,
        entry: Entry<N>,
        entry_id: EntryId,
        run_token: RunToken,
        generation: Generation,
        previous_dep_generations: Option<Vec<(EntryId, Generation)>>,
        previous_result: Option<EntryResult<N>>,
    ) -> (EntryState<N>, AsyncValueReceiver<NodeResult<N>>) {
        // Increment the RunToken to uniquely identify this work.
        let run_token = run_token.next();
        let context = context_factory.clone_for(entry_id);
        let context2 = context.clone();
        let entry2 = entry.clone();
        let (value, mut sender, receiver) = AsyncValue::<NodeResult<N>, NodeInterrupt>::new();
        let is_cleaning = previous_dep_generations.is_some();

        let run_or_clean = async move {
            // If there are previous dependency generations, compare them against the current
            // generations of all dependencies (which may recursively clean them): if they
            // match, the previous result is still valid.
            let clean_with_deps = if let Some(previous_dep_generations) = previous_dep_generations
            {
                match context
                    .graph()
                    .attempt_cleaning(entry_id, run_token, &previous_dep_generations, &context)
                    .await
                {
                    Err(()) => {
                        // Dependency generations mismatched: the node must re-run.
                        context
                            .inner_stats()
                            .cleaning_failed
                            .fetch_add(1, atomic::Ordering::SeqCst);
                        Err(())
                    }
                    Ok(uncacheable) => {
                        context
                            .inner_stats()
                            .cleaning_succeeded
                            .fetch_add(1, atomic::Ordering::SeqCst);
                        Ok(DepState {
                            generations: previous_dep_generations,
                            has_uncacheable_deps: uncacheable,
                        })
                    }
                }
            } else {
                Err(())
            };

            match clean_with_deps {
                Ok(dep_state) => {
                    // No dependency changed: the Node completes without re-running, keeping
                    // its previous result and generation.
                    (None, dep_state)
                }
                Err(()) => {
                    // The Node needs to (re-)run.
                    let res = entry.node().clone().run(context.clone()).await;
                    context
                        .inner_stats()
                        .ran
                        .fetch_add(1, atomic::Ordering::SeqCst);
                    (Some(res), context.complete())
                }
            }
        };

        let executor = context2.graph().executor().clone();
        let _join = executor.native_spawn(async move {
            let mut run_or_clean = pin!(run_or_clean);
            let (maybe_res, dep_state) = loop {
                tokio::select! {
                  interrupt_item = sender.interrupted() => {
                    match interrupt_item {
                      Some(NodeInterrupt::Dirtied) => {
                          // Check whether the dependencies requested so far are still
                          // valid, and cancel the work to be restarted if not.
                          let dep_generations_so_far = context2.dep_generations_so_far();
                          if context2
                            .graph()
                            .attempt_cleaning(entry_id, run_token, &dep_generations_so_far, &context2)
                            .await.is_err() {
                            return;
                          }
                          // No dependency actually changed: continue running.
                      }
                      None => {
                          // Cancelled via drop: exit.
                          entry2.cancel(run_token);
                          return;
                      }
                    }
                  }
                  maybe_res_and_state = &mut run_or_clean => {
                    // Running (or cleaning) the Node completed.
                    break maybe_res_and_state
                  }
                }
            };
            entry2.complete(
                &context2,
                run_token,
                sender,
                dep_state.generations,
                dep_state.has_uncacheable_deps,
                maybe_res,
            );
        });

        (
            EntryState::Running {
                run_token,
                pending_value: value,
                generation,
                previous_result,
                is_cleaning,
            },
            receiver,
        )
    }

    ///
    /// Returns a Future for the Node's value-and-generation.
    ///
    /// Two separate state matches handle the borrow-vs-consume split: the first returns
    /// early for in-flight or clean nodes by reference; the second consumes the state in
    /// order to (re)start execution without cloning its contents.
    ///
    pub(crate) fn get_node_result(
        &self,
        context: &Context<N>,
        entry_id: EntryId,
    ) -> BoxFuture<'static, NodeResult<N>> {
        let mut state = self.state.lock();

        match *state {
            EntryState::Running {
                ref pending_value,
                generation,
                ..
            } => {
                if let Some(receiver) = pending_value.receiver() {
                    return async move {
                        receiver.recv().await.unwrap_or_else(|| {
                            (Err(N::Error::invalidated()), generation.next(), true)
                        })
                    }
                    .boxed();
                }
                // Else: the node was just cancelled: fall through to restart it.
            }
            EntryState::Completed {
                ref result,
                generation,
                ..
            } if result.is_clean(context) => {
                return future::ready((
                    Ok(result.as_ref().clone()),
                    generation,
                    result.has_uncacheable_deps(),
                ))
                .boxed();
            }
            _ => (),
        }

        let (next_state, receiver) = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::NotStarted {
                run_token,
                generation,
                previous_result,
            }
            | EntryState::Running {
                run_token,
                generation,
                previous_result,
                ..
            } => Self::spawn_node_execution(
                context,
                self.clone(),
                entry_id,
                run_token,
                generation,
                None,
                previous_result,
            ),
            EntryState::Completed {
                run_token,
                generation,
                result,
                dep_generations,
            } => {
                test_trace_log!(
                    "Re-starting node {:?}. It was: previous_result={:?}",
                    self.node,
                    result,
                );
                assert!(
                    !result.is_clean(context),
                    "A clean Node should not reach this point: {result:?}"
                );
                // The Node has completed but needs to re-run. If it is dirty, we are the
                // first requester since it was dirtied, and attempt to clean it (which will
                // re-run it if the dep generations mismatch). If it is uncacheable, it runs
                // from scratch for this Run.
                Self::spawn_node_execution(
                    context,
                    self.clone(),
                    entry_id,
                    run_token,
                    generation,
                    if self.cacheable_with_output(Some(result.as_ref())) {
                        Some(dep_generations)
                    } else {
                        None
                    },
                    Some(result),
                )
            }
        };

        // Swap in the new state, and return a Future for the receiver.
        let generation = match &next_state {
            EntryState::Running { generation, .. } => *generation,
            _ => unreachable!("spawn_node_execution returns a Running state"),
        };
        *state = next_state;

        async move {
            receiver
                .recv()
                .await
                .unwrap_or_else(|| (Err(N::Error::invalidated()), generation.next(), true))
        }
        .boxed()
    }

    ///
    /// Called by the spawned task when a Node's work is cancelled.
    ///
    /// See also: `Self::complete`.
    ///
    pub(crate) fn cancel(&self, result_run_token: RunToken) {
        let mut state = self.state.lock();

        // Exactly one case matters: a Running state with the same run_token. All other
        // states represent various (legal) race conditions; see `RunToken`.
        match *state {
            EntryState::Running { run_token, .. } if result_run_token == run_token => {}
            _ => return,
        }

        *state = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                generation,
                previous_result,
                ..
            } => {
                test_trace_log!("Canceling {:?} of {}.", run_token, self.node);
                EntryState::NotStarted {
                    run_token: run_token.next(),
                    generation,
                    previous_result,
                }
            }
            s => s,
        };
    }

    ///
    /// Called by the spawned task when a Node completes.
    ///
    /// A `result` of None indicates that the Node was found to be clean, and that its
    /// previous result should be re-used. This special case avoids 1) cloning the result to
    /// call this method, and 2) comparing the current/previous results unnecessarily.
    ///
    /// See also: `Self::cancel`.
    ///
    fn complete(
        &self,
        context: &Context<N>,
        result_run_token: RunToken,
        sender: AsyncValueSender<NodeResult<N>, NodeInterrupt>,
        dep_generations: Vec<(EntryId, Generation)>,
        has_uncacheable_deps: bool,
        result: Option<Result<N::Item, N::Error>>,
    ) {
        let mut state = self.state.lock();

        // Exactly one case matters: a Running state with the same run_token. All other
        // states represent various (legal) race conditions.
        match *state {
            EntryState::Running { run_token, .. } if result_run_token == run_token => {}
            _ => {
                test_trace_log!(
                    "Not completing node {:?} because it was invalidated.",
                    self.node
                );
                return;
            }
        }

        *state = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                mut generation,
                mut previous_result,
                ..
            } => {
                match result {
                    Some(Err(e)) => {
                        if let Some(previous_result) = previous_result.as_mut() {
                            previous_result.dirty();
                        }
                        generation = generation.next();
                        sender.send((Err(e), generation, true));
                        // Errors are not memoised as Completed states: a subsequent request
                        // re-runs the Node (the sender above has delivered this error to
                        // all current requesters).
                        EntryState::NotStarted {
                            run_token: run_token.next(),
                            generation,
                            previous_result,
                        }
                    }
                    Some(Ok(result)) => {
                        let cacheable = self.cacheable_with_output(Some(&result));
                        let next_result: EntryResult<N> =
                            EntryResult::new(result, context, cacheable, has_uncacheable_deps);
                        if Some(next_result.as_ref())
                            != previous_result.as_ref().map(EntryResult::as_ref)
                        {
                            // The Node re-ran and produced a different value.
                            generation = generation.next()
                        }
                        sender.send((
                            Ok(next_result.as_ref().clone()),
                            generation,
                            next_result.has_uncacheable_deps(),
                        ));
                        EntryState::Completed {
                            result: next_result,
                            dep_generations,
                            run_token,
                            generation,
                        }
                    }
                    None => {
                        // The Node was clean.
                        // NB: The `expect` avoids a clone and a comparison: see the docs.
                        let mut result = previous_result
                            .expect("A Node cannot be marked clean without a previous result.");
                        result.clean(
                            context,
                            self.cacheable_with_output(Some(result.as_ref())),
                            has_uncacheable_deps,
                        );
                        sender.send((
                            Ok(result.as_ref().clone()),
                            generation,
                            result.has_uncacheable_deps(),
                        ));
                        EntryState::Completed {
                            result,
                            dep_generations,
                            run_token,
                            generation,
                        }
                    }
                }
            }
            s => s,
        };
    }

    ///
    /// Clears the state of this Node, forcing it to be recomputed.
    ///
    /// `graph_still_contains_edges` is false when the caller guarantees that all outbound
    /// edges from this Node have been removed from the graph.
    ///
    pub(crate) fn clear(&self, graph_still_contains_edges: bool) {
        let mut state = self.state.lock();

        let (run_token, generation, mut previous_result) =
            match mem::replace(&mut *state, EntryState::initial()) {
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_result,
                } => (run_token, generation, previous_result),
                EntryState::Running {
                    run_token,
                    pending_value,
                    generation,
                    previous_result,
                    ..
                } => {
                    // Dropping the pending value cancels the running task.
                    std::mem::drop(pending_value);
                    (run_token, generation, previous_result)
                }
                EntryState::Completed {
                    run_token,
                    generation,
                    result,
                    ..
                } => (run_token, generation, Some(result)),
            };

        test_trace_log!("Clearing node {:?}", self.node);

        if graph_still_contains_edges {
            if let Some(previous_result) = previous_result.as_mut() {
                previous_result.dirty();
            }
        }

        // Swap in a state with a new RunToken value, which invalidates any outstanding work.
        *state = EntryState::NotStarted {
            run_token: run_token.next(),
            generation,
            previous_result,
        };
    }

    ///
    /// Dirties this Node, causing it to examine its dependencies the next time it is
    /// requested, and re-run if any of them have changed generations.
    ///
    pub(crate) fn dirty(&self) {
        let state = &mut *self.state.lock();
        test_trace_log!("Dirtying node {:?}", self.node);
        match state {
            EntryState::Completed { ref mut result, .. } => {
                result.dirty();
                return;
            }
            EntryState::NotStarted { .. } => return,
            EntryState::Running {
                ref mut pending_value,
                ..
            } => {
                // Attempt to interrupt the Running node with the news that it was dirtied.
                // If the interrupt cannot be delivered, fall through to cancel it.
                if pending_value.try_interrupt(NodeInterrupt::Dirtied).is_ok() {
                    return;
                }
            }
        }

        *state = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                pending_value,
                generation,
                previous_result,
                ..
            } => {
                test_trace_log!(
                    "Failed to interrupt {:?} while running: canceling instead.",
                    self.node
                );
                std::mem::drop(pending_value);
                EntryState::NotStarted {
                    run_token: run_token.next(),
                    generation,
                    previous_result,
                }
            }
            s => s,
        }
    }

    ///
    /// Flags that cleaning this Node has failed (its deps changed), returning an error if
    /// the RunToken no longer matches.
    ///
    pub(crate) fn cleaning_failed(&self, expected_run_token: RunToken) -> Result<(), ()> {
        let state = &mut *self.state.lock();
        match state {
            EntryState::Running {
                is_cleaning,
                run_token,
                ..
            } if *run_token == expected_run_token => {
                *is_cleaning = false;
                Ok(())
            }
            _ => Err(()),
        }
    }

    pub fn is_started(&self) -> bool {
        match *self.state.lock() {
            EntryState::NotStarted { .. } => false,
            EntryState::Completed { .. } | EntryState::Running { .. } => true,
        }
    }

    pub fn is_running(&self) -> bool {
        match *self.state.lock() {
            EntryState::Running { .. } => true,
            EntryState::Completed { .. } | EntryState::NotStarted { .. } => false,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn generation(&self) -> Generation {
        match *self.state.lock() {
            EntryState::NotStarted { generation, .. }
            | EntryState::Running { generation, .. }
            | EntryState::Completed { generation, .. } => generation,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn has_uncacheable_deps(&self) -> bool {
        match *self.state.lock() {
            EntryState::Completed { ref result, .. } => result.has_uncacheable_deps(),
            _ => false,
        }
    }

    pub(crate) fn format(&self, context: &Context<N>) -> String {
        let state = match self.peek(context) {
            Some(ref nr) => {
                let item = format!("{nr:?}");
                if item.len() <= 1024 {
                    item
                } else {
                    item.chars().take(1024).collect()
                }
            }
            None => "<None>".to_string(),
        };
        format!("{} == {}", self.node, state)
    }
}
