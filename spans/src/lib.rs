// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Workunits: structured spans describing engine work, consumed by log output and by
//! embedders polling `WorkunitStore::latest_workunits`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, hash_map};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::time::{Duration, SystemTime};

use hdrhistogram::Histogram;
pub use log::Level;
use parking_lot::Mutex;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{VisitMap, Visitable};
use rand::Rng;
use rand::thread_rng;
use smallvec::SmallVec;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task_local;

mod metrics;
pub use metrics::{Metric, ObservationMetric};

///
/// A unique id for a single run (or `--loop` iteration) within a single scheduler instance.
///
/// RunIds are not comparable across schedulers: only equality is meaningful.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SpanId(u64);

impl SpanId {
    pub fn new() -> SpanId {
        SpanId(thread_rng().r#gen())
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016.x}", self.0)
    }
}

type ParentIds = SmallVec<[SpanId; 2]>;

/// The interval during which a workunit was running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: SystemTime,
    pub duration: Duration,
}

impl TimeSpan {
    pub fn since(start: &SystemTime) -> TimeSpan {
        TimeSpan {
            start: *start,
            duration: start.elapsed().unwrap_or_default(),
        }
    }
}

pub fn format_workunit_duration_ms(duration_ms: u128) -> String {
    format!("{:.2}s", (duration_ms as f64) / 1000.0)
}

///
/// Workunits form a DAG of running and completed work. While running, a copy of the Workunit
/// lives on the stack inside the `in_workunit!` macro, and a second copy is registered with
/// the store; completing the macro scope finalises the stored copy.
///
#[derive(Clone, Debug)]
pub struct Workunit {
    pub name: &'static str,
    pub level: Level,
    pub span_id: SpanId,
    // A workunit starts with at most one parent, but may gain more over its life due to
    // memoisation of the node it describes.
    pub parent_ids: ParentIds,
    pub state: WorkunitState,
    pub metadata: Option<WorkunitMetadata>,
}

impl Workunit {
    pub fn time_span(&self) -> Option<TimeSpan> {
        match self.state {
            WorkunitState::Started { .. } => None,
            WorkunitState::Completed { time_span } => Some(time_span),
        }
    }

    fn log_workunit_state(&self, canceled: bool) {
        let metadata = match self.metadata.as_ref() {
            Some(metadata) if log::log_enabled!(self.level) => metadata,
            _ => return,
        };

        let state = match (&self.state, canceled) {
            (_, true) => "Canceled:",
            (WorkunitState::Started { .. }, _) => "Starting:",
            (WorkunitState::Completed { .. }, _) => "Completed:",
        };

        let identifier = metadata.desc.as_deref().unwrap_or(self.name);
        let message = match &metadata.message {
            Some(s) => format!(" - {s}"),
            None => String::new(),
        };
        log::log!(self.level, "{state} {identifier}{message}");
    }
}

#[derive(Clone, Debug)]
pub enum WorkunitState {
    Started {
        start_time: SystemTime,
        blocked: Arc<AtomicBool>,
    },
    Completed {
        time_span: TimeSpan,
    },
}

impl WorkunitState {
    fn blocked(&self) -> bool {
        match self {
            WorkunitState::Started { blocked, .. } => blocked.load(atomic::Ordering::Relaxed),
            WorkunitState::Completed { .. } => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkunitMetadata {
    pub desc: Option<String>,
    pub message: Option<String>,
    pub stdout: Option<fingerprint::Digest>,
    pub stderr: Option<fingerprint::Digest>,
}

enum StoreMsg {
    Started(Workunit),
    Completed(SpanId, Option<WorkunitMetadata>, SystemTime, bool),
    Canceled(#[allow(dead_code)] SpanId),
}

/// Running workunits, plus tombstones for completed workunits which still had running
/// children (to preserve transitive parent information for late completions).
#[derive(Default)]
struct RunningWorkunitGraph {
    graph: StableDiGraph<SpanId, (), u32>,
    entries: HashMap<SpanId, (NodeIndex<u32>, Level, Option<Workunit>)>,
}

impl RunningWorkunitGraph {
    fn add(&mut self, workunit: Workunit) {
        let parent_ids = workunit.parent_ids.clone();
        let child = self.graph.add_node(workunit.span_id);
        self.entries
            .insert(workunit.span_id, (child, workunit.level, Some(workunit)));
        for parent_id in parent_ids {
            if let Some((parent, _, _)) = self.entries.get(&parent_id) {
                self.graph.add_edge(*parent, child, ());
            }
        }
    }

    fn complete(
        &mut self,
        span_id: SpanId,
        new_metadata: Option<WorkunitMetadata>,
        end_time: SystemTime,
    ) -> Option<Workunit> {
        match self.entries.entry(span_id) {
            hash_map::Entry::Vacant(_) => {
                log::warn!("No previously-started workunit found for id: {span_id}");
                None
            }
            hash_map::Entry::Occupied(mut entry) => {
                // Taking the Workunit turns the entry into a tombstone.
                let (node, _, workunit) = entry.get_mut();
                let mut workunit = workunit.take()?;

                workunit.parent_ids = self
                    .graph
                    .neighbors_directed(*node, petgraph::Direction::Incoming)
                    .map(|parent| self.graph[parent])
                    .collect();

                // Childless workunits are removed outright; others leave their tombstone in
                // place so that late-completing children can still compute parents.
                if self
                    .graph
                    .neighbors_directed(*node, petgraph::Direction::Outgoing)
                    .next()
                    .is_none()
                {
                    self.graph.remove_node(*node);
                    entry.remove();
                }

                match workunit.state {
                    WorkunitState::Completed { .. } => {
                        log::warn!("Workunit {span_id} was already completed");
                    }
                    WorkunitState::Started { start_time, .. } => {
                        let mut time_span = TimeSpan::since(&start_time);
                        if let Ok(duration) = end_time.duration_since(start_time) {
                            time_span.duration = duration;
                        }
                        workunit.state = WorkunitState::Completed { time_span };
                    }
                }
                workunit.metadata = new_metadata;
                Some(workunit)
            }
        }
    }

    /// The non-blocked leaves of the graph: the workunits that are actually executing.
    fn running_leaves(&self) -> impl Iterator<Item = SpanId> + '_ {
        self.graph
            .externals(petgraph::Direction::Outgoing)
            .map(|node| self.graph[node])
            .filter_map(|span_id| {
                self.entries
                    .get(&span_id)
                    .and_then(|(_, _, workunit)| workunit.as_ref())
            })
            .filter(|workunit| !workunit.state.blocked())
            .map(|workunit| workunit.span_id)
    }

    /// Finds the first visible parents of the given spans; once a parent matches, none of its
    /// own parents are visited.
    fn first_matched_parents(
        &self,
        span_ids: impl IntoIterator<Item = SpanId>,
        is_visible: impl Fn(Level, Option<&Workunit>) -> bool,
    ) -> HashSet<SpanId> {
        let mut visited = self.graph.visit_map();
        let mut to_visit = span_ids.into_iter().collect::<Vec<_>>();
        let mut parent_ids = HashSet::new();
        while let Some(current) = to_visit.pop() {
            let Some((node, level, workunit)) = self.entries.get(&current) else {
                continue;
            };
            if !visited.visit(*node) {
                continue;
            }

            if is_visible(*level, workunit.as_ref()) {
                parent_ids.insert(current);
                continue;
            }

            to_visit.extend(
                self.graph
                    .neighbors_directed(*node, petgraph::Direction::Incoming)
                    .map(|parent| self.graph[parent]),
            );
        }
        parent_ids
    }
}

struct StreamingWorkunitData {
    msg_tx: UnboundedSender<StoreMsg>,
    msg_rx: Mutex<UnboundedReceiver<StoreMsg>>,
    running_graph: Mutex<RunningWorkunitGraph>,
}

impl StreamingWorkunitData {
    fn new() -> StreamingWorkunitData {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        StreamingWorkunitData {
            msg_tx,
            msg_rx: Mutex::new(msg_rx),
            running_graph: Mutex::default(),
        }
    }

    fn latest_workunits(&self, max_verbosity: Level) -> (Vec<Workunit>, Vec<Workunit>) {
        let mut started_messages = Vec::new();
        let mut completed_messages = Vec::new();
        {
            let mut msg_rx = self.msg_rx.lock();
            while let Ok(msg) = msg_rx.try_recv() {
                match msg {
                    StoreMsg::Started(wu) => started_messages.push(wu),
                    StoreMsg::Completed(span, metadata, time, was_canceled) => {
                        completed_messages.push((span, metadata, time, was_canceled))
                    }
                    StoreMsg::Canceled(..) => (),
                }
            }
        }

        let mut running_graph = self.running_graph.lock();
        let started_workunits = started_messages
            .into_iter()
            .filter_map(|wu| {
                running_graph.add(wu.clone());
                if wu.level <= max_verbosity {
                    Some(wu)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        let completed_workunits = completed_messages
            .into_iter()
            .filter_map(|(span_id, metadata, end_time, was_canceled)| {
                let workunit = running_graph.complete(span_id, metadata, end_time)?;
                if !was_canceled && workunit.level <= max_verbosity {
                    Some(workunit)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        (started_workunits, completed_workunits)
    }
}

struct MetricsData {
    counters: Mutex<HashMap<Metric, u64>>,
    observations: Mutex<HashMap<ObservationMetric, Histogram<u64>>>,
}

impl MetricsData {
    fn new() -> MetricsData {
        MetricsData {
            counters: Mutex::default(),
            observations: Mutex::default(),
        }
    }
}

///
/// Tracks the workunits of one scheduler, and exposes polling access to their start/completion
/// events, the set of currently-running spans, and the accumulated metrics.
///
#[derive(Clone)]
pub struct WorkunitStore {
    log_starting_workunits: bool,
    max_level: Level,
    streaming_data: Arc<StreamingWorkunitData>,
    // A separate copy of the running graph used to answer "what is running right now"
    // without consuming the streaming queues.
    running_graph: Arc<Mutex<RunningWorkunitGraph>>,
    metrics_data: Arc<MetricsData>,
}

impl WorkunitStore {
    pub fn new(log_starting_workunits: bool, max_level: Level) -> WorkunitStore {
        WorkunitStore {
            log_starting_workunits,
            max_level,
            streaming_data: Arc::new(StreamingWorkunitData::new()),
            running_graph: Arc::default(),
            metrics_data: Arc::new(MetricsData::new()),
        }
    }

    pub fn init_thread_state(&self, parent_id: Option<SpanId>) {
        set_thread_workunit_store_handle(Some(WorkunitStoreHandle {
            store: self.clone(),
            parent_id,
        }))
    }

    pub fn max_level(&self) -> Level {
        self.max_level
    }

    ///
    /// Describes the current running leaves, for straggler logging: name, description, and
    /// elapsed duration of every visible workunit with no running children.
    ///
    pub fn straggling_workunits(&self, threshold: Duration) -> Vec<(Duration, String)> {
        let now = SystemTime::now();
        let running_graph = self.running_graph.lock();
        let matching_visible_parents = running_graph
            .first_matched_parents(running_graph.running_leaves(), |level, workunit| {
                level <= self.max_level && workunit.and_then(|wu| duration_for(now, wu)).is_some()
            })
            .into_iter()
            .filter_map(|span_id| {
                let workunit = running_graph
                    .entries
                    .get(&span_id)
                    .and_then(|(_, _, wu)| wu.as_ref())?;
                let duration = duration_for(now, workunit)?;
                if duration >= threshold {
                    let desc = workunit
                        .metadata
                        .as_ref()
                        .and_then(|m| m.desc.clone())
                        .unwrap_or_else(|| workunit.name.to_owned());
                    Some((duration, desc))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        matching_visible_parents
    }

    #[doc(hidden)]
    pub fn start_workunit(&self, workunit: Workunit) {
        let _ = self
            .streaming_data
            .msg_tx
            .send(StoreMsg::Started(workunit.clone()));
        if self.log_starting_workunits {
            workunit.log_workunit_state(false)
        }
        self.running_graph.lock().add(workunit);
    }

    fn complete_workunit(&self, workunit: Workunit, new_metadata: Option<WorkunitMetadata>) {
        let end_time = SystemTime::now();
        let _ = self.streaming_data.msg_tx.send(StoreMsg::Completed(
            workunit.span_id,
            new_metadata.clone(),
            end_time,
            false,
        ));
        if let Some(completed) =
            self.running_graph
                .lock()
                .complete(workunit.span_id, new_metadata, end_time)
        {
            completed.log_workunit_state(false);
        }
    }

    fn cancel_workunit(&self, workunit: &Workunit) {
        let _ = self
            .streaming_data
            .msg_tx
            .send(StoreMsg::Canceled(workunit.span_id));
        let _ = self.running_graph.lock().complete(
            workunit.span_id,
            workunit.metadata.clone(),
            SystemTime::now(),
        );
        workunit.log_workunit_state(true);
    }

    ///
    /// Drains the started and completed queues, filtered to the given maximum level.
    ///
    pub fn latest_workunits(&self, max_verbosity: Level) -> (Vec<Workunit>, Vec<Workunit>) {
        self.streaming_data.latest_workunits(max_verbosity)
    }

    pub fn increment_counter(&self, counter_name: Metric, change: u64) {
        let mut counters = self.metrics_data.counters.lock();
        *counters.entry(counter_name).or_insert(0) += change;
    }

    pub fn get_metrics(&self) -> HashMap<&'static str, u64> {
        let counters = self.metrics_data.counters.lock();
        counters
            .iter()
            .map(|(metric, value)| {
                let name: &'static str = (*metric).into();
                (name, *value)
            })
            .collect()
    }

    ///
    /// Records an observation of a time-like or size-like metric into a histogram.
    ///
    pub fn record_observation(&self, metric: ObservationMetric, value: u64) {
        let mut observations = self.metrics_data.observations.lock();
        let histogram = observations.entry(metric).or_insert_with(|| {
            Histogram::<u64>::new(3).expect("Creating a histogram should not fail")
        });
        let _ = histogram.record(value);
    }

    pub fn get_observation_histograms(&self) -> HashMap<&'static str, Histogram<u64>> {
        let observations = self.metrics_data.observations.lock();
        observations
            .iter()
            .map(|(metric, histogram)| {
                let name: &'static str = (*metric).into();
                (name, histogram.clone())
            })
            .collect()
    }
}

fn duration_for(now: SystemTime, workunit: &Workunit) -> Option<Duration> {
    match workunit.state {
        WorkunitState::Started { start_time, .. } => now.duration_since(start_time).ok(),
        _ => None,
    }
}

///
/// The per-thread/task handle to the store: tracks the current parent span so that nested
/// workunits attach themselves correctly.
///
#[derive(Clone)]
pub struct WorkunitStoreHandle {
    pub store: WorkunitStore,
    pub parent_id: Option<SpanId>,
}

thread_local! {
  static THREAD_WORKUNIT_STORE_HANDLE: RefCell<Option<WorkunitStoreHandle>> = const { RefCell::new(None) };
}

task_local! {
  static TASK_WORKUNIT_STORE_HANDLE: Option<WorkunitStoreHandle>;
}

pub fn set_thread_workunit_store_handle(workunit_store_handle: Option<WorkunitStoreHandle>) {
    THREAD_WORKUNIT_STORE_HANDLE.with(|handle| {
        *handle.borrow_mut() = workunit_store_handle;
    })
}

pub fn get_workunit_store_handle() -> Option<WorkunitStoreHandle> {
    if let Ok(Some(handle)) =
        TASK_WORKUNIT_STORE_HANDLE.try_with(|handle| (*handle).clone())
    {
        Some(handle)
    } else {
        THREAD_WORKUNIT_STORE_HANDLE.with(|handle| (*handle.borrow()).clone())
    }
}

pub fn expect_workunit_store_handle() -> WorkunitStoreHandle {
    get_workunit_store_handle().expect("A WorkunitStore has not been set for this thread.")
}

pub async fn scope_task_workunit_store_handle<F>(
    workunit_store_handle: Option<WorkunitStoreHandle>,
    f: F,
) -> F::Output
where
    F: Future,
{
    TASK_WORKUNIT_STORE_HANDLE.scope(workunit_store_handle, f).await
}

///
/// The live view of a started workunit within the `in_workunit!` macro body: supports
/// updating metadata, recording counters, and flagging the workunit as blocked.
///
pub struct RunningWorkunit {
    store: WorkunitStore,
    workunit: Option<Workunit>,
    metadata: Option<WorkunitMetadata>,
}

impl RunningWorkunit {
    pub fn new(
        store: WorkunitStore,
        workunit: Workunit,
        metadata: Option<WorkunitMetadata>,
    ) -> RunningWorkunit {
        RunningWorkunit {
            store,
            workunit: Some(workunit),
            metadata,
        }
    }

    pub fn workunit_store(&self) -> WorkunitStore {
        self.store.clone()
    }

    pub fn increment_counter(&mut self, counter_name: Metric, change: u64) {
        self.store.increment_counter(counter_name, change);
    }

    pub fn record_observation(&mut self, metric: ObservationMetric, value: u64) {
        self.store.record_observation(metric, value);
    }

    ///
    /// Replaces the workunit's metadata (and optionally its level) on completion.
    ///
    pub fn update_metadata<F>(&mut self, f: F)
    where
        F: FnOnce(Option<(WorkunitMetadata, Level)>) -> Option<(WorkunitMetadata, Level)>,
    {
        if let Some(workunit) = &mut self.workunit {
            if let Some((metadata, level)) =
                f(self.metadata.clone().map(|m| (m, workunit.level)))
            {
                workunit.level = level;
                self.metadata = Some(metadata);
            }
        }
    }

    ///
    /// Marks the workunit as blocked (on a semaphore, a remote call, etc) until the returned
    /// token is dropped.
    ///
    pub fn blocking(&mut self) -> BlockingWorkunitToken {
        let mut token = BlockingWorkunitToken(None);
        if let Some(workunit) = &mut self.workunit {
            if let WorkunitState::Started { blocked, .. } = &mut workunit.state {
                blocked.store(true, atomic::Ordering::Relaxed);
                token.0 = Some(blocked.clone());
            }
        }
        token
    }

    pub fn complete(&mut self) {
        if let Some(workunit) = self.workunit.take() {
            self.store.complete_workunit(workunit, self.metadata.take());
        }
    }
}

impl Drop for RunningWorkunit {
    fn drop(&mut self) {
        if let Some(workunit) = self.workunit.take() {
            self.store.cancel_workunit(&workunit);
        }
    }
}

pub struct BlockingWorkunitToken(Option<Arc<AtomicBool>>);

impl Drop for BlockingWorkunitToken {
    fn drop(&mut self) {
        if let Some(blocked) = self.0.take() {
            blocked.store(false, atomic::Ordering::Relaxed);
        }
    }
}

///
/// Runs the given async block inside a new workunit. The block receives a
/// `&mut RunningWorkunit` which it may use to update metadata or record metrics.
///
#[macro_export]
macro_rules! in_workunit {
    ($workunit_name: expr, $workunit_level: expr $(, $optional_field_name:ident = $optional_field_value:expr)*, |$workunit: ident| $f: expr $(,)?) => {{
        use futures::future::FutureExt;
        let mut store_handle = $crate::expect_workunit_store_handle();
        let level: log::Level = $workunit_level;
        #[allow(unused_mut)]
        let mut metadata: Option<$crate::WorkunitMetadata> = if level <= store_handle.store.max_level() {
            Some($crate::WorkunitMetadata::default())
        } else {
            None
        };
        $(
          if let Some(m) = metadata.as_mut() {
            m.$optional_field_name = $optional_field_value;
          }
        )*
        let span_id = $crate::SpanId::new();
        let parent_ids = store_handle.parent_id.into_iter().collect();
        store_handle.parent_id = Some(span_id);
        let workunit = $crate::Workunit {
            name: $workunit_name,
            level,
            span_id,
            parent_ids,
            state: $crate::WorkunitState::Started {
                start_time: std::time::SystemTime::now(),
                blocked: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            },
            metadata: metadata.clone(),
        };
        let store = store_handle.store.clone();
        $crate::scope_task_workunit_store_handle(Some(store_handle), async move {
            store.start_workunit(workunit.clone());
            let mut $workunit = $crate::RunningWorkunit::new(store, workunit, metadata);
            let result = {
                let $workunit = &mut $workunit;
                $f
            }
            .await;
            $workunit.complete();
            result
        })
        .boxed()
    }};
}

#[cfg(test)]
mod tests;
