// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU32};

use parking_lot::Mutex;
use spans::{Level, RunId, WorkunitStore};
use syncutil::AsyncLatch;

use crate::context::{Context, Core, SessionCore};
use crate::nodes::NodeKey;
use crate::types::Value;

///
/// Values the embedder provides to a single Session, consumable by rules through the
/// session-values intrinsic.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SessionValues(pub BTreeMap<String, String>);

/// The current RunId as an engine value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RunIdValue(pub u32);

struct SessionState {
    core: Arc<Core>,
    // The roots requested within this Session: holding them here keeps their subgraphs
    // alive across graph garbage collection.
    roots: Mutex<Vec<NodeKey>>,
    workunit_store: WorkunitStore,
    session_values: Mutex<SessionValues>,
    // Controls the visibility of uncacheable rules: generally constant for a Session, but
    // `--loop` style callers bump it to observe fresh values without discarding the
    // Session.
    run_id: AtomicU32,
}

struct SessionHandle {
    // The unique id of this Session, for metrics.
    build_id: String,
    // Triggered when this Session is cancelled: all work it started should then exit in an
    // orderly fashion at the next suspension point.
    cancelled: AsyncLatch,
}

///
/// A Session represents a related series of requests (generally: one client invocation) on
/// the scheduler, and is the scope for cancellation and metrics.
///
/// The handle/state split allows a shallow clone of a Session with independent cancellation
/// but shared identity and memoisation scope.
///
#[derive(Clone)]
pub struct Session {
    handle: Arc<SessionHandle>,
    state: Arc<SessionState>,
}

impl Session {
    pub fn new(
        core: Arc<Core>,
        build_id: String,
        session_values: SessionValues,
        cancelled: AsyncLatch,
        max_workunit_level: Level,
    ) -> Session {
        let workunit_store = WorkunitStore::new(true, max_workunit_level);
        let run_id = core.graph.generate_run_id();
        Session {
            handle: Arc::new(SessionHandle {
                build_id,
                cancelled,
            }),
            state: Arc::new(SessionState {
                core,
                roots: Mutex::default(),
                workunit_store,
                session_values: Mutex::new(session_values),
                run_id: AtomicU32::new(run_id.0),
            }),
        }
    }

    ///
    /// Creates a shallow clone of this Session which is independently cancellable, but which
    /// shares identity and state with the original.
    ///
    pub fn isolated_shallow_clone(&self, build_id: String) -> Session {
        Session {
            handle: Arc::new(SessionHandle {
                build_id,
                cancelled: AsyncLatch::new(),
            }),
            state: self.state.clone(),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.state.core
    }

    ///
    /// A graph Context for this Session.
    ///
    pub fn graph_context(&self) -> Context {
        self.state
            .core
            .graph
            .context_with_run_id(SessionCore::new(self.clone()), self.run_id())
    }

    pub fn cancel(&self) {
        self.handle.cancelled.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.cancelled.poll_triggered()
    }

    ///
    /// Returns only once this Session has been cancelled.
    ///
    pub async fn cancelled(&self) {
        self.handle.cancelled.triggered().await;
    }

    pub fn build_id(&self) -> &str {
        &self.handle.build_id
    }

    pub fn workunit_store(&self) -> WorkunitStore {
        self.state.workunit_store.clone()
    }

    pub fn session_values(&self) -> Value {
        Value::new(self.state.session_values.lock().clone())
    }

    pub fn run_id(&self) -> RunId {
        RunId(self.state.run_id.load(atomic::Ordering::SeqCst))
    }

    ///
    /// Bumps the RunId, which re-enables computation of uncacheable nodes for the next
    /// request on this Session.
    ///
    pub fn new_run_id(&self) {
        self.state.run_id.store(
            self.state.core.graph.generate_run_id().0,
            atomic::Ordering::SeqCst,
        );
    }

    pub(crate) fn roots_extend(&self, new_roots: Vec<NodeKey>) {
        self.state.roots.lock().extend(new_roots);
    }

    pub(crate) fn roots_nodes(&self) -> Vec<NodeKey> {
        self.state.roots.lock().clone()
    }

    ///
    /// Extends the leases of every store digest observed by this Session, keeping them
    /// alive for garbage collection purposes.
    ///
    pub async fn extend_digest_leases(&self) -> Result<(), String> {
        let context = self.graph_context();
        let mut digests = Vec::new();
        self.state
            .core
            .graph
            .visit_live_reachable(&self.roots_nodes(), &context, |_, output| {
                digests.extend(output.digests());
            });
        self.state
            .core
            .store
            .lease_all(digests.into_iter().map(|d| (d, cas::EntryType::File)))
            .await
    }
}
