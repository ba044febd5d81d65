// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The node kinds of the engine's memoising graph: user rule invocations (`TaskNode`),
//! filesystem primitives (which register invalidation subscriptions), and the intrinsic
//! operations which bridge to the store and the process executor.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use internment::Intern;
use memo::Node;
use solver::DependencyKey;
use spans::{Level, in_workunit};
use vfs::{Dir, DirectoryListing, File, Link, Vfs};

use crate::context::{Context, SessionCore};
use crate::downloads;
use crate::tasks::{Rule, Task};
use crate::types::{Failure, Key, Params, TypeId, Value, throw};

pub type NodeResult<T> = Result<T, Failure>;

///
/// Resolves the given pre-compiled rule graph entry with the given parameters: either a
/// parameter is consumed directly, or a Task or Intrinsic node executes.
///
pub(crate) fn select(
    context: Context,
    mut params: Params,
    entry: Intern<solver::Entry<Rule>>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        params.retain(|k| match entry.as_ref() {
            solver::Entry::Param(type_id) => type_id == k.type_id(),
            solver::Entry::WithDeps(with_deps) => with_deps.params().contains(k.type_id()),
        });
        match entry.as_ref() {
            solver::Entry::WithDeps(wd) => match wd.as_ref() {
                solver::EntryWithDeps::Rule(rule_entry) => match rule_entry.rule() {
                    Rule::Task(task) => {
                        let output = context
                            .get(NodeKey::Task(Box::new(TaskNode {
                                params,
                                task: task.clone(),
                                entry,
                            })))
                            .await?;
                        match output {
                            NodeOutput::Value(value) => Ok(value),
                            output => Err(throw(format!(
                                "A task produced an unexpected output: {output:?}"
                            ))),
                        }
                    }
                    Rule::Intrinsic(intrinsic) => {
                        let values = futures::future::try_join_all(
                            intrinsic
                                .inputs
                                .iter()
                                .map(|dependency_key| {
                                    select_product(
                                        context.clone(),
                                        params.clone(),
                                        dependency_key,
                                        entry,
                                    )
                                })
                                .collect::<Vec<_>>(),
                        )
                        .await?;
                        let intrinsics = context.app().core.intrinsics.clone();
                        intrinsics
                            .run(intrinsic.as_ref(), context.clone(), values)
                            .await
                    }
                },
                solver::EntryWithDeps::Root(_) => {
                    panic!("Not a runtime-executable entry: {entry:?}")
                }
            },
            solver::Entry::Param(type_id) => {
                if let Some(key) = params.find(type_id) {
                    Ok(key.to_value())
                } else {
                    Err(throw(format!(
                        "Expected a Param of type {type_id} to be present, but had only: {params}",
                    )))
                }
            }
        }
    }
    .boxed()
}

pub(crate) fn select_product<'a>(
    context: Context,
    params: Params,
    dependency_key: &'a DependencyKey<TypeId>,
    entry: Intern<solver::Entry<Rule>>,
) -> BoxFuture<'a, NodeResult<Value>> {
    async move {
        let edges = context
            .app()
            .core
            .rule_graph
            .edges_for_inner(entry.as_ref())
            .ok_or_else(|| {
                throw(format!("Tried to request {dependency_key} but found no edges"))
            })?;
        let dep_entry = edges.entry_for(dependency_key).ok_or_else(|| {
            throw(format!(
                "{entry:?} did not declare a dependency on {dependency_key}"
            ))
        })?;
        select(context, params, dep_entry).await
    }
    .boxed()
}

///
/// The face of the engine which a running Task sees: its in-scope parameters, plus the
/// ability to perform the Gets its rule declared.
///
#[derive(Clone)]
pub struct TaskContext {
    context: Context,
    entry: Intern<solver::Entry<Rule>>,
    params: Params,
}

impl TaskContext {
    ///
    /// Requests the declared Get with the given output type and provided parameter values.
    ///
    pub async fn get(&self, output: TypeId, provided: Vec<Key>) -> Result<Value, Failure> {
        let dependency_key =
            DependencyKey::new_with_params(output, provided.iter().map(|k| *k.type_id()));
        let mut params = self.params.clone();
        params.extend(provided);
        select_product(self.context.clone(), params, &dependency_key, self.entry).await
    }

    ///
    /// Typed convenience for `get`: requests the output type `T`.
    ///
    pub async fn get_typed<T: std::any::Any + Clone>(
        &self,
        provided: Vec<Key>,
    ) -> Result<T, Failure> {
        let value = self.get(TypeId::of::<T>(), provided).await?;
        value.extract::<T>().map_err(throw)
    }

    ///
    /// The positional parameter of type `T` declared by this rule.
    ///
    pub fn param<T: std::any::Any + Clone>(&self) -> Result<T, Failure> {
        let type_id = TypeId::of::<T>();
        let key = self
            .params
            .find(&type_id)
            .ok_or_else(|| throw(format!("No parameter of type {type_id} was in scope.")))?;
        key.to_value().extract::<T>().map_err(throw)
    }
}

///
/// A user rule invocation: identified by the rule, its parameters, and its position in the
/// rule graph.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskNode {
    pub params: Params,
    pub task: Arc<Task>,
    pub entry: Intern<solver::Entry<Rule>>,
}

impl TaskNode {
    async fn run_node(self, context: Context) -> NodeResult<Value> {
        let task_context = TaskContext {
            context: context.clone(),
            entry: self.entry,
            params: self.params.clone(),
        };
        (self.task.func)(task_context).await
    }
}

/// A request to digest a single workspace file into the store.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DigestFile(pub File);

impl DigestFile {
    async fn run_node(self, context: Context) -> NodeResult<fingerprint::Digest> {
        let core = &context.app().core;
        let path = core.vfs.file_path(&self.0);
        core.store
            .store_file(true, false, path)
            .await
            .map_err(throw)
    }
}

/// A request to read the (sorted, ignore-filtered) listing of a workspace directory.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Scandir(pub Dir);

impl Scandir {
    async fn run_node(self, context: Context) -> NodeResult<Arc<DirectoryListing>> {
        let core = &context.app().core;
        core.vfs
            .scandir(self.0)
            .await
            .map(Arc::new)
            .map_err(|e| throw(format!("{e}")))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LinkDest(pub std::path::PathBuf);

/// A request to read the destination of a workspace symlink.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReadLink(pub Link);

impl ReadLink {
    async fn run_node(self, context: Context) -> NodeResult<LinkDest> {
        let core = &context.app().core;
        core.vfs
            .read_link(&self.0)
            .await
            .map(LinkDest)
            .map_err(|e| throw(format!("{e}")))
    }
}

/// A request to capture a Snapshot of the paths matching some globs in the workspace.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SnapshotNode {
    pub path_globs: vfs::PathGlobs,
}

impl SnapshotNode {
    pub(crate) async fn resolve_path_stats(
        context: Context,
        path_globs: vfs::PathGlobs,
    ) -> NodeResult<Vec<vfs::PathStat>> {
        use vfs::GlobMatching;
        let prepared = path_globs.parse().map_err(throw)?;
        context
            .clone()
            .expand_globs(prepared, vfs::SymlinkBehavior::Aware, None)
            .await
    }

    async fn run_node(self, context: Context) -> NodeResult<cas::Snapshot> {
        let path_stats = Self::resolve_path_stats(context.clone(), self.path_globs).await?;
        cas::Snapshot::from_path_stats(context.clone(), path_stats)
            .await
            .map_err(|e| throw(format!("Snapshot failed: {e}")))
    }
}

/// A request to download (and verify, and store) the file at a URL.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DownloadedFile {
    pub url: String,
    pub expected_digest: fingerprint::Digest,
}

impl DownloadedFile {
    async fn run_node(self, context: Context) -> NodeResult<cas::Snapshot> {
        downloads::download_and_snapshot(
            context.app().core.clone(),
            self.url,
            self.expected_digest,
        )
        .await
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessResult {
    pub result: exec::FallibleProcessResult,
}

/// A request to execute a Process in its execution environment.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExecuteProcess {
    pub process: exec::Process,
}

impl ExecuteProcess {
    async fn run_node(
        self,
        context: Context,
        workunit: &mut spans::RunningWorkunit,
    ) -> NodeResult<ProcessResult> {
        let core = context.app().core.clone();
        self.process.validate().map_err(throw)?;
        let execution_context = exec::Context::new(
            context.app().session.workunit_store(),
            context.app().session.build_id().to_owned(),
            context.run_id(),
        );
        let result = core
            .command_runner
            .run(execution_context, workunit, self.process)
            .await?;
        Ok(ProcessResult { result })
    }
}

/// The session-provided values, as an uncacheable node.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionValues;

/// The current RunId, as an uncacheable node (so that `--loop` style callers observe fresh
/// values per run).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RunIdNode;

///
/// An external request: resolves the declared Query matching the given product and params.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Root {
    pub params: Params,
    pub product: TypeId,
}

impl Root {
    async fn run_node(self, context: Context) -> NodeResult<Value> {
        let edges = context
            .app()
            .core
            .rule_graph
            .find_root(self.params.type_ids(), self.product)
            .map(|(_, edges)| edges)
            .map_err(throw)?;
        let entry = edges
            .entry_for(&DependencyKey::new(self.product))
            .unwrap_or_else(|| panic!("{edges:?} did not declare a dependency on {}", self.product));
        select(context, self.params, entry).await
    }
}

///
/// There is large variance in the sizes of the members of this enum, so a few of them are
/// boxed.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum NodeKey {
    DigestFile(DigestFile),
    DownloadedFile(DownloadedFile),
    ExecuteProcess(Box<ExecuteProcess>),
    ReadLink(ReadLink),
    Scandir(Scandir),
    SessionValues(SessionValues),
    RunId(RunIdNode),
    Snapshot(SnapshotNode),
    Task(Box<TaskNode>),
    Root(Box<Root>),
}

impl NodeKey {
    ///
    /// The filesystem path which this Node depends on directly, if any: the watcher
    /// subscribes to these paths before the Node runs (I5), and invalidation matches
    /// changed paths against them.
    ///
    pub fn fs_subject(&self) -> Option<&Path> {
        match self {
            NodeKey::DigestFile(s) => Some(s.0.path.as_path()),
            NodeKey::ReadLink(s) => Some(s.0.path.as_path()),
            NodeKey::Scandir(s) => Some(s.0.0.as_path()),

            // Not filesystem operations. Explicitly listed so that new NodeKeys must
            // consider whether they represent one.
            NodeKey::ExecuteProcess { .. }
            | NodeKey::Root { .. }
            | NodeKey::SessionValues { .. }
            | NodeKey::RunId { .. }
            | NodeKey::Snapshot { .. }
            | NodeKey::Task { .. }
            | NodeKey::DownloadedFile { .. } => None,
        }
    }

    fn workunit_level(&self) -> Level {
        match self {
            NodeKey::Task(ref task) => task.task.display_info.level,
            // A Process is rendered at debug until it actually begins executing (it is
            // likely to be blocked on the bounded runner first).
            NodeKey::ExecuteProcess(..) => Level::Debug,
            _ => Level::Trace,
        }
    }

    ///
    /// The workunit name for this node: machine-parseable (`my_rule`, not "My rule!").
    ///
    pub fn workunit_name(&self) -> &'static str {
        match self {
            NodeKey::Task(..) => "task",
            NodeKey::ExecuteProcess(..) => "process",
            NodeKey::Snapshot(..) => "snapshot",
            NodeKey::DigestFile(..) => "digest_file",
            NodeKey::DownloadedFile(..) => "downloaded_file",
            NodeKey::ReadLink(..) => "read_link",
            NodeKey::Scandir(..) => "scandir",
            NodeKey::Root(..) => "root",
            NodeKey::SessionValues(..) => "session_values",
            NodeKey::RunId(..) => "run_id",
        }
    }

    fn workunit_desc(&self) -> Option<String> {
        match self {
            NodeKey::Task(ref task) => task.task.display_info.desc.clone(),
            NodeKey::Snapshot(ref s) => Some(format!("Snapshotting: {}", s.path_globs)),
            NodeKey::ExecuteProcess(epr) => {
                Some(format!("Scheduling: {}", epr.process.description))
            }
            NodeKey::DigestFile(DigestFile(File { path, .. })) => {
                Some(format!("Fingerprinting: {}", path.display()))
            }
            NodeKey::ReadLink(ReadLink(Link { path, .. })) => {
                Some(format!("Reading link: {}", path.display()))
            }
            NodeKey::Scandir(Scandir(Dir(path))) => {
                Some(format!("Reading directory: {}", path.display()))
            }
            NodeKey::DownloadedFile(f) => Some(format!("Downloading: {}", f.url)),
            NodeKey::Root(..) | NodeKey::SessionValues(..) | NodeKey::RunId(..) => None,
        }
    }

    ///
    /// Ensures that a filesystem watch exists for this Node's subject before it observes
    /// the filesystem.
    ///
    async fn maybe_watch(&self, context: &Context) -> NodeResult<()> {
        let Some((path, watcher)) = self
            .fs_subject()
            .zip(context.app().core.watcher.as_ref())
        else {
            return Ok(());
        };
        let abs_path = context.app().core.build_root.join(path);
        watcher
            .watch(abs_path)
            .await
            .map_err(|e| throw(format!("Failed to watch filesystem: {e:?}")))
    }
}

#[async_trait]
impl Node for NodeKey {
    type Context = SessionCore;

    type Item = NodeOutput;
    type Error = Failure;

    async fn run(self, context: Context) -> Result<NodeOutput, Failure> {
        let workunit_name = self.workunit_name();
        let workunit_desc = self.workunit_desc();

        in_workunit!(
            workunit_name,
            self.workunit_level(),
            desc = workunit_desc.clone(),
            |workunit| async move {
                // Install filesystem watches before Nodes which inspect the filesystem.
                let maybe_watch = self.maybe_watch(&context).await;

                let mut result = match self {
                    NodeKey::DigestFile(n) => {
                        n.run_node(context).await.map(NodeOutput::FileDigest)
                    }
                    NodeKey::DownloadedFile(n) => {
                        n.run_node(context).await.map(NodeOutput::Snapshot)
                    }
                    NodeKey::ExecuteProcess(n) => n
                        .run_node(context, workunit)
                        .await
                        .map(|r| NodeOutput::ProcessResult(Box::new(r))),
                    NodeKey::ReadLink(n) => n.run_node(context).await.map(NodeOutput::LinkDest),
                    NodeKey::Scandir(n) => {
                        n.run_node(context).await.map(NodeOutput::DirectoryListing)
                    }
                    NodeKey::SessionValues(_) => {
                        Ok(NodeOutput::Value(context.app().session.session_values()))
                    }
                    NodeKey::RunId(_) => Ok(NodeOutput::Value(Value::new(
                        crate::session::RunIdValue(context.run_id().0),
                    ))),
                    NodeKey::Snapshot(n) => n.run_node(context).await.map(NodeOutput::Snapshot),
                    NodeKey::Task(n) => n.run_node(context).await.map(NodeOutput::Value),
                    NodeKey::Root(n) => n.run_node(context).await.map(NodeOutput::Value),
                };

                // If both the Node and the watch failed, prefer the Node's error message.
                if let (Ok(_), Err(e)) = (&result, maybe_watch) {
                    result = Err(e);
                }

                // Failed nodes gain a frame naming the work that failed.
                result = result.map_err(|failure| {
                    failure.with_pushed_frame(workunit_desc.as_deref().unwrap_or(workunit_name))
                });

                result
            }
        )
        .await
    }

    fn restartable(&self) -> bool {
        // A side-effecting task may only run once: invalidation does not pass through it,
        // and it is never restarted mid-run.
        match self {
            NodeKey::Task(s) => !s.task.side_effecting,
            _ => true,
        }
    }

    fn cacheable(&self) -> bool {
        match self {
            NodeKey::Task(s) => s.task.cacheable,
            NodeKey::SessionValues(_) | NodeKey::RunId(_) => false,
            NodeKey::ExecuteProcess(p) => {
                p.process.cache_scope != exec::ProcessCacheScope::Never
            }
            _ => true,
        }
    }

    fn cacheable_item(&self, output: &NodeOutput) -> bool {
        match (self, output) {
            (NodeKey::ExecuteProcess(ref ep), NodeOutput::ProcessResult(ref process_result)) => {
                match ep.process.cache_scope {
                    exec::ProcessCacheScope::Always | exec::ProcessCacheScope::PerRestart => true,
                    exec::ProcessCacheScope::Successful => process_result.result.exit_code == 0,
                    exec::ProcessCacheScope::PerSession | exec::ProcessCacheScope::Never => false,
                }
            }
            _ => true,
        }
    }

    fn cyclic_error(path: &[&NodeKey]) -> Failure {
        let mut path = path.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        if !path.is_empty() {
            path[0] += " <-";
            path.push(path[0].clone());
        }
        throw(format!(
            "The dependency graph contained a cycle:\n\n  {}\n\nIf the dependencies in the above \
       path are for your BUILD targets, you may need to use more granular targets or replace \
       BUILD target dependencies with file dependencies.",
            path.join("\n  ")
        ))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            NodeKey::DigestFile(s) => write!(f, "DigestFile({})", s.0.path.display()),
            NodeKey::DownloadedFile(s) => write!(f, "DownloadedFile({})", s.url),
            NodeKey::ExecuteProcess(s) => write!(f, "Process({})", s.process.description),
            NodeKey::ReadLink(s) => write!(f, "ReadLink({})", (s.0).path.display()),
            NodeKey::Scandir(s) => write!(f, "Scandir({})", (s.0).0.display()),
            NodeKey::Root(s) => write!(f, "{}", s.product),
            NodeKey::Task(task) => write!(f, "@rule({})", task.task.id),
            NodeKey::Snapshot(s) => write!(f, "Snapshot({})", s.path_globs),
            NodeKey::SessionValues(_) => write!(f, "SessionValues"),
            NodeKey::RunId(_) => write!(f, "RunId"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeOutput {
    FileDigest(fingerprint::Digest),
    Snapshot(cas::Snapshot),
    DirectoryListing(Arc<DirectoryListing>),
    LinkDest(LinkDest),
    ProcessResult(Box<ProcessResult>),
    Value(Value),
}

impl NodeOutput {
    ///
    /// The digests which this output holds live: a Session extends leases for the digests
    /// of the outputs it has observed, protecting them from garbage collection.
    ///
    pub fn digests(&self) -> Vec<fingerprint::Digest> {
        match self {
            NodeOutput::FileDigest(d) => vec![*d],
            NodeOutput::Snapshot(s) => {
                let dd: vfs::DirectoryDigest = s.clone().into();
                dd.digests()
            }
            NodeOutput::ProcessResult(p) => {
                let mut digests = p.result.output_directory.digests();
                digests.push(p.result.stdout_digest);
                digests.push(p.result.stderr_digest);
                digests
            }
            NodeOutput::DirectoryListing(_) | NodeOutput::LinkDest(_) | NodeOutput::Value(_) => {
                vec![]
            }
        }
    }
}

impl TryFrom<NodeOutput> for Value {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::Value(v) => Ok(v),
            _ => Err(()),
        }
    }
}

///
/// Glob expansion against the memoising graph: scandir and read_link requests made while
/// expanding globs become graph nodes, so that their results are memoised and their
/// filesystem subjects are watched.
///
#[async_trait]
impl Vfs<Failure> for Context {
    async fn read_link(&self, link: &Link) -> Result<std::path::PathBuf, Failure> {
        match self.get(NodeKey::ReadLink(ReadLink(link.clone()))).await? {
            NodeOutput::LinkDest(LinkDest(path)) => Ok(path),
            output => Err(throw(format!("Unexpected output: {output:?}"))),
        }
    }

    async fn scandir(&self, dir: Dir) -> Result<Arc<DirectoryListing>, Failure> {
        match self.get(NodeKey::Scandir(Scandir(dir))).await? {
            NodeOutput::DirectoryListing(listing) => Ok(listing),
            output => Err(throw(format!("Unexpected output: {output:?}"))),
        }
    }

    fn is_ignored(&self, stat: &vfs::Stat) -> bool {
        self.app().core.vfs.is_ignored(stat)
    }

    fn mk_error(msg: &str) -> Failure {
        throw(msg.to_owned())
    }
}

impl cas::StoreFileByDigest<Failure> for Context {
    fn store_by_digest(
        &self,
        file: File,
    ) -> BoxFuture<'static, Result<fingerprint::Digest, Failure>> {
        let context = self.clone();
        async move {
            match context.get(NodeKey::DigestFile(DigestFile(file))).await? {
                NodeOutput::FileDigest(digest) => Ok(digest),
                output => Err(throw(format!("Unexpected output: {output:?}"))),
            }
        }
        .boxed()
    }
}
