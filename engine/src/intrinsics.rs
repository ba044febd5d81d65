// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The built-in rules: digest operations, snapshotting, downloads, and process execution,
//! registered with the solver exactly like user rules so that the compiler reasons about
//! them uniformly.

use std::path::PathBuf;

use bytes::Bytes;
use cas::{SnapshotOps, SubsetParams};
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use solver::{DependencyKey, RuleId};
use vfs::{DirectoryDigest, PathGlobs, RelativePath};

use crate::context::Context;
use crate::nodes::{
    DownloadedFile, ExecuteProcess, NodeKey, NodeOutput, NodeResult, SnapshotNode,
};
use crate::session::{RunIdValue, SessionValues};
use crate::tasks::{Intrinsic, Tasks};
use crate::types::{Failure, TypeId, Value, throw};

/// Creates a digest with the given file contents.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CreateDigest(pub Vec<(RelativePath, Bytes, bool)>);

/// Merges the given directory digests into one (failing on conflicting entries).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MergeDigests(pub Vec<DirectoryDigest>);

/// Adds a prefix to the given digest.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AddPrefix {
    pub digest: DirectoryDigest,
    pub prefix: RelativePath,
}

/// Strips a prefix from the given digest.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RemovePrefix {
    pub digest: DirectoryDigest,
    pub prefix: RelativePath,
}

/// Subsets the given digest to the paths matching the globs.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DigestSubset {
    pub digest: DirectoryDigest,
    pub globs: PathGlobs,
}

/// Downloads a file (with digest verification) into the store.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NativeDownloadFile {
    pub url: String,
    pub expected_digest: fingerprint::Digest,
}

/// The sorted paths matched by some globs, without digesting their content.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Paths {
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

/// The eagerly-loaded contents of the files of a directory digest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestContents(pub Vec<vfs::FileContent>);

/// The leaf entries of a directory digest, without file content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestEntries(pub Vec<vfs::DigestEntry>);

type IntrinsicFn =
    Box<dyn Fn(Context, Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> + Send + Sync>;

pub struct Intrinsics {
    intrinsics: IndexMap<Intrinsic, IntrinsicFn>,
}

impl Intrinsics {
    pub fn new() -> Intrinsics {
        let mut intrinsics: IndexMap<Intrinsic, IntrinsicFn> = IndexMap::new();
        intrinsics.insert(
            Intrinsic::new(
                "path_globs_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<PathGlobs>(),
            ),
            Box::new(path_globs_to_digest),
        );
        intrinsics.insert(
            Intrinsic::new(
                "path_globs_to_paths",
                TypeId::of::<Paths>(),
                TypeId::of::<PathGlobs>(),
            ),
            Box::new(path_globs_to_paths),
        );
        intrinsics.insert(
            Intrinsic::new(
                "create_digest_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<CreateDigest>(),
            ),
            Box::new(create_digest_to_digest),
        );
        intrinsics.insert(
            Intrinsic::new(
                "merge_digests_request_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<MergeDigests>(),
            ),
            Box::new(merge_digests_request_to_digest),
        );
        intrinsics.insert(
            Intrinsic::new(
                "add_prefix_request_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<AddPrefix>(),
            ),
            Box::new(add_prefix_request_to_digest),
        );
        intrinsics.insert(
            Intrinsic::new(
                "remove_prefix_request_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<RemovePrefix>(),
            ),
            Box::new(remove_prefix_request_to_digest),
        );
        intrinsics.insert(
            Intrinsic::new(
                "digest_subset_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<DigestSubset>(),
            ),
            Box::new(digest_subset_to_digest),
        );
        intrinsics.insert(
            Intrinsic::new(
                "digest_to_snapshot",
                TypeId::of::<cas::Snapshot>(),
                TypeId::of::<DirectoryDigest>(),
            ),
            Box::new(digest_to_snapshot),
        );
        intrinsics.insert(
            Intrinsic::new(
                "directory_digest_to_digest_contents",
                TypeId::of::<DigestContents>(),
                TypeId::of::<DirectoryDigest>(),
            ),
            Box::new(directory_digest_to_digest_contents),
        );
        intrinsics.insert(
            Intrinsic::new(
                "directory_digest_to_digest_entries",
                TypeId::of::<DigestEntries>(),
                TypeId::of::<DirectoryDigest>(),
            ),
            Box::new(directory_digest_to_digest_entries),
        );
        intrinsics.insert(
            Intrinsic::new(
                "download_file_to_digest",
                TypeId::of::<DirectoryDigest>(),
                TypeId::of::<NativeDownloadFile>(),
            ),
            Box::new(download_file_to_digest),
        );
        intrinsics.insert(
            Intrinsic {
                id: RuleId::new("process_request_to_process_result"),
                product: TypeId::of::<crate::nodes::ProcessResult>(),
                inputs: vec![
                    DependencyKey::new(TypeId::of::<exec::Process>()),
                    DependencyKey::new(TypeId::of::<exec::ProcessExecutionEnvironment>()),
                ],
            },
            Box::new(process_request_to_process_result),
        );
        intrinsics.insert(
            Intrinsic {
                id: RuleId::new("session_values"),
                product: TypeId::of::<SessionValues>(),
                inputs: vec![],
            },
            Box::new(session_values),
        );
        intrinsics.insert(
            Intrinsic {
                id: RuleId::new("run_id"),
                product: TypeId::of::<RunIdValue>(),
                inputs: vec![],
            },
            Box::new(run_id),
        );
        Intrinsics { intrinsics }
    }

    /// Registers every intrinsic as a rule.
    pub fn install(&self, tasks: &mut Tasks) {
        for intrinsic in self.intrinsics.keys() {
            tasks.add_intrinsic(intrinsic.clone());
        }
    }

    pub async fn run(
        &self,
        intrinsic: &Intrinsic,
        context: Context,
        args: Vec<Value>,
    ) -> NodeResult<Value> {
        let function = self
            .intrinsics
            .get(intrinsic)
            .unwrap_or_else(|| panic!("Unrecognized intrinsic: {intrinsic:?}"));
        function(context, args).await
    }
}

fn extract_arg<T: std::any::Any + Clone>(args: &[Value], index: usize) -> Result<T, Failure> {
    args.get(index)
        .ok_or_else(|| throw(format!("Missing intrinsic argument {index}")))?
        .extract::<T>()
        .map_err(throw)
}

fn path_globs_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let path_globs = extract_arg::<PathGlobs>(&args, 0)?;
        let snapshot = snapshot_for(context, path_globs).await?;
        Ok(Value::new::<DirectoryDigest>(snapshot.into()))
    }
    .boxed()
}

fn path_globs_to_paths(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let path_globs = extract_arg::<PathGlobs>(&args, 0)?;
        let path_stats = SnapshotNode::resolve_path_stats(context, path_globs).await?;
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for ps in path_stats {
            match ps {
                vfs::PathStat::File { path, .. } => files.push(path),
                vfs::PathStat::Link { path, .. } => files.push(path),
                vfs::PathStat::Dir { path, .. } => dirs.push(path),
            }
        }
        Ok(Value::new(Paths { files, dirs }))
    }
    .boxed()
}

fn create_digest_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let create_digest = extract_arg::<CreateDigest>(&args, 0)?;
        let digest = context
            .app()
            .core
            .store
            .create_digest(create_digest.0)
            .await?;
        Ok(Value::new(digest))
    }
    .boxed()
}

fn merge_digests_request_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let merge = extract_arg::<MergeDigests>(&args, 0)?;
        let digest = context.app().core.store.merge(merge.0).await?;
        Ok(Value::new(digest))
    }
    .boxed()
}

fn add_prefix_request_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let request = extract_arg::<AddPrefix>(&args, 0)?;
        let digest = context
            .app()
            .core
            .store
            .add_prefix(request.digest, &request.prefix)
            .await?;
        Ok(Value::new(digest))
    }
    .boxed()
}

fn remove_prefix_request_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let request = extract_arg::<RemovePrefix>(&args, 0)?;
        let digest = context
            .app()
            .core
            .store
            .strip_prefix(request.digest, &request.prefix)
            .await?;
        Ok(Value::new(digest))
    }
    .boxed()
}

fn digest_subset_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let request = extract_arg::<DigestSubset>(&args, 0)?;
        let globs = request.globs.parse().map_err(throw)?;
        let digest = context
            .app()
            .core
            .store
            .subset(request.digest, SubsetParams { globs })
            .await?;
        Ok(Value::new(digest))
    }
    .boxed()
}

fn digest_to_snapshot(context: Context, args: Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let digest = extract_arg::<DirectoryDigest>(&args, 0)?;
        let snapshot = cas::Snapshot::from_digest(context.app().core.store.clone(), digest).await?;
        Ok(Value::new(snapshot))
    }
    .boxed()
}

fn directory_digest_to_digest_contents(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let digest = extract_arg::<DirectoryDigest>(&args, 0)?;
        let contents = context
            .app()
            .core
            .store
            .contents_for_directory(digest)
            .await?;
        Ok(Value::new(DigestContents(contents)))
    }
    .boxed()
}

fn directory_digest_to_digest_entries(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let digest = extract_arg::<DirectoryDigest>(&args, 0)?;
        let entries = context
            .app()
            .core
            .store
            .entries_for_directory(digest)
            .await?;
        Ok(Value::new(DigestEntries(entries)))
    }
    .boxed()
}

fn download_file_to_digest(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let request = extract_arg::<NativeDownloadFile>(&args, 0)?;
        let snapshot = match context
            .get(NodeKey::DownloadedFile(DownloadedFile {
                url: request.url,
                expected_digest: request.expected_digest,
            }))
            .await?
        {
            NodeOutput::Snapshot(snapshot) => snapshot,
            output => return Err(throw(format!("Unexpected output: {output:?}"))),
        };
        Ok(Value::new::<DirectoryDigest>(snapshot.into()))
    }
    .boxed()
}

fn process_request_to_process_result(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let mut process = extract_arg::<exec::Process>(&args, 0)?;
        let environment = extract_arg::<exec::ProcessExecutionEnvironment>(&args, 1)?;
        process.execution_environment = environment;
        match context
            .get(NodeKey::ExecuteProcess(Box::new(ExecuteProcess { process })))
            .await?
        {
            NodeOutput::ProcessResult(result) => Ok(Value::new(*result)),
            output => Err(throw(format!("Unexpected output: {output:?}"))),
        }
    }
    .boxed()
}

fn session_values(context: Context, _args: Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        match context.get(NodeKey::SessionValues(crate::nodes::SessionValues)).await? {
            NodeOutput::Value(value) => Ok(value),
            output => Err(throw(format!("Unexpected output: {output:?}"))),
        }
    }
    .boxed()
}

fn run_id(context: Context, _args: Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        match context.get(NodeKey::RunId(crate::nodes::RunIdNode)).await? {
            NodeOutput::Value(value) => Ok(value),
            output => Err(throw(format!("Unexpected output: {output:?}"))),
        }
    }
    .boxed()
}

async fn snapshot_for(context: Context, path_globs: PathGlobs) -> NodeResult<cas::Snapshot> {
    match context
        .get(NodeKey::Snapshot(SnapshotNode { path_globs }))
        .await?
    {
        NodeOutput::Snapshot(snapshot) => Ok(snapshot),
        output => Err(throw(format!("Unexpected output: {output:?}"))),
    }
}
