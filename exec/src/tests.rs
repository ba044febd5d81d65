// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cas::{LocalOptions, Store};
use spans::{Level, RunningWorkunit, WorkunitStore};
use tempfile::TempDir;
use vfs::RelativePath;

use crate::local::KeepSandboxes;
use crate::{
    CacheName, CommandRunner as CommandRunnerTrait, Context, FallibleProcessResult, NamedCaches,
    Platform, Process, ProcessCacheScope, ProcessError, ProcessExecutionEnvironment,
    ProcessExecutionStrategy, make_execute_request,
};

struct TestHarness {
    store: Store,
    context: Context,
    _store_dir: TempDir,
    work_dir: TempDir,
    named_caches_dir: TempDir,
}

fn harness() -> TestHarness {
    let workunit_store = WorkunitStore::new(false, Level::Debug);
    workunit_store.init_thread_state(None);
    let store_dir = TempDir::new().unwrap();
    let store = Store::local_only_with_options(
        pool::Executor::new(),
        store_dir.path(),
        LocalOptions {
            files_max_size_bytes: 16 * 1024 * 1024,
            directories_max_size_bytes: 16 * 1024 * 1024,
            ..LocalOptions::default()
        },
    )
    .unwrap();
    TestHarness {
        store,
        context: Context::new(workunit_store, "test-build".to_owned(), spans::RunId(0)),
        _store_dir: store_dir,
        work_dir: TempDir::new().unwrap(),
        named_caches_dir: TempDir::new().unwrap(),
    }
}

fn local_environment() -> ProcessExecutionEnvironment {
    ProcessExecutionEnvironment::local(Platform::current().unwrap())
}

fn sh_process(script: &str) -> Process {
    let mut process = Process::new(
        vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
        ],
        local_environment(),
    );
    process.description = format!("sh -c {script}");
    process
}

fn local_runner(harness: &TestHarness) -> crate::local::CommandRunner {
    crate::local::CommandRunner::new(
        harness.store.clone(),
        pool::Executor::new(),
        harness.work_dir.path().to_owned(),
        NamedCaches::new(harness.named_caches_dir.path().to_owned()),
        KeepSandboxes::Never,
        Duration::from_secs(1),
    )
}

async fn run(
    runner: &dyn CommandRunnerTrait,
    harness: &TestHarness,
    process: Process,
) -> Result<FallibleProcessResult, ProcessError> {
    let mut workunit = spans::RunningWorkunit::new(
        harness.context.workunit_store.clone(),
        spans::Workunit {
            name: "test",
            level: Level::Debug,
            span_id: spans::SpanId::new(),
            parent_ids: Default::default(),
            state: spans::WorkunitState::Started {
                start_time: std::time::SystemTime::now(),
                blocked: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            },
            metadata: None,
        },
        None,
    );
    runner.run(harness.context.clone(), &mut workunit, process).await
}

async fn stdout_of(harness: &TestHarness, result: &FallibleProcessResult) -> String {
    let bytes = harness
        .store
        .load_file_bytes_with(result.stdout_digest, Bytes::copy_from_slice)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn stdout_is_captured() {
    let harness = harness();
    let runner = local_runner(&harness);
    let result = run(&runner, &harness, sh_process("echo hello")).await.unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(stdout_of(&harness, &result).await, "hello\n");
}

#[tokio::test]
async fn nonzero_exit_is_a_result_not_an_error() {
    let harness = harness();
    let runner = local_runner(&harness);
    let result = run(&runner, &harness, sh_process("exit 42")).await.unwrap();
    assert_eq!(result.exit_code, 42);
}

#[tokio::test]
async fn output_files_are_captured() {
    let harness = harness();
    let runner = local_runner(&harness);
    let mut process = sh_process("printf hi > out");
    process
        .output_files
        .insert(RelativePath::new("out").unwrap());
    let result = run(&runner, &harness, process).await.unwrap();
    assert_eq!(result.exit_code, 0);

    let contents = harness
        .store
        .contents_for_directory(result.output_directory)
        .await
        .unwrap();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].path, std::path::PathBuf::from("out"));
    assert_eq!(&contents[0].content[..], b"hi");
}

#[tokio::test]
async fn output_dir_parents_are_precreated() {
    let harness = harness();
    let runner = local_runner(&harness);
    let mut process = sh_process("printf hi > nested/dir/out");
    process
        .output_files
        .insert(RelativePath::new("nested/dir/out").unwrap());
    let result = run(&runner, &harness, process).await.unwrap();
    assert_eq!(result.exit_code, 0, "nested output dirs should pre-exist");
}

#[tokio::test]
async fn timeouts_produce_a_distinguished_result() {
    let harness = harness();
    let runner = local_runner(&harness);
    let mut process = sh_process("sleep 30");
    process.timeout = Some(Duration::from_millis(200));
    let start = std::time::Instant::now();
    let result = run(&runner, &harness, process).await.unwrap();
    assert!(result.timed_out());
    // The process group is killed promptly rather than waiting out the sleep.
    assert!(start.elapsed() < Duration::from_secs(10));
    let stderr = harness
        .store
        .load_file_bytes_with(result.stderr_digest, Bytes::copy_from_slice)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&stderr).contains("Exceeded timeout"));
}

#[tokio::test]
async fn named_caches_are_symlinked_into_the_sandbox() {
    let harness = harness();
    let runner = local_runner(&harness);
    let mut process = sh_process("printf persisted >> cache_dir/seen; cat cache_dir/seen");
    process.append_only_caches.insert(
        CacheName::new("test_cache".to_owned()).unwrap(),
        RelativePath::new("cache_dir").unwrap(),
    );

    // The cache content survives across two separate sandboxes.
    let first = run(&runner, &harness, process.clone()).await.unwrap();
    assert_eq!(stdout_of(&harness, &first).await, "persisted");
    let second = run(&runner, &harness, process).await.unwrap();
    assert_eq!(stdout_of(&harness, &second).await, "persistedpersisted");
}

#[derive(Debug)]
struct CountingRunner {
    inner: Box<dyn CommandRunnerTrait>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandRunnerTrait for CountingRunner {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.run(context, workunit, req).await
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.inner.shutdown().await
    }
}

#[tokio::test]
async fn second_identical_process_is_a_cache_hit() {
    // Running the same process twice must not spawn a second subprocess, and the cache-hit
    // counter increments by exactly one.
    let harness = harness();
    let runs = Arc::new(AtomicUsize::new(0));
    let counting = CountingRunner {
        inner: Box::new(local_runner(&harness)),
        runs: runs.clone(),
    };
    let cache_dir = TempDir::new().unwrap();
    let cache = crate::cache::PersistentCache::new(
        cache_dir.path().to_owned(),
        16 * 1024 * 1024,
        pool::Executor::new(),
        4,
    )
    .unwrap();
    let runner = crate::cache::CommandRunner::new(
        Arc::new(counting),
        cache,
        harness.store.clone(),
        true,
        None,
    );

    let mut process = sh_process("printf hi > out");
    process
        .output_files
        .insert(RelativePath::new("out").unwrap());

    let first = run(&runner, &harness, process.clone()).await.unwrap();
    let second = run(&runner, &harness, process).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(first.exit_code, 0);
    assert_eq!(second.exit_code, 0);
    assert_eq!(first.output_directory, second.output_directory);

    let metrics = harness.context.workunit_store.get_metrics();
    assert_eq!(metrics.get("local_cache_requests_cached"), Some(&1));
    assert_eq!(metrics.get("local_cache_requests"), Some(&2));
}

#[tokio::test]
async fn failing_results_are_not_cached_under_successful_scope() {
    let harness = harness();
    let runs = Arc::new(AtomicUsize::new(0));
    let counting = CountingRunner {
        inner: Box::new(local_runner(&harness)),
        runs: runs.clone(),
    };
    let cache_dir = TempDir::new().unwrap();
    let cache = crate::cache::PersistentCache::new(
        cache_dir.path().to_owned(),
        16 * 1024 * 1024,
        pool::Executor::new(),
        4,
    )
    .unwrap();
    let runner = crate::cache::CommandRunner::new(
        Arc::new(counting),
        cache,
        harness.store.clone(),
        true,
        None,
    );

    let process = sh_process("exit 1");
    assert_eq!(ProcessCacheScope::Successful, process.cache_scope);
    run(&runner, &harness, process.clone()).await.unwrap();
    run(&runner, &harness, process).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn execution_slot_variable_is_injected() {
    let harness = harness();
    let runner = crate::bounded::CommandRunner::new(Box::new(local_runner(&harness)), 4);
    let mut process = sh_process("printf '%s' \"$SLOT\"");
    process.execution_slot_variable = Some("SLOT".to_owned());
    let result = run(&runner, &harness, process).await.unwrap();
    let slot: usize = stdout_of(&harness, &result).await.parse().unwrap();
    assert!((1..=4).contains(&slot));
}

#[test]
fn cache_key_varies_by_environment() {
    let local = sh_process("echo hi");
    let mut docker = local.clone();
    docker.execution_environment = ProcessExecutionEnvironment {
        name: None,
        platform: Platform::current().unwrap(),
        strategy: ProcessExecutionStrategy::Docker("ubuntu:22.04".to_owned()),
    };

    let local_key = make_execute_request(&local, None, None).unwrap().action_digest;
    let docker_key = make_execute_request(&docker, None, None).unwrap().action_digest;
    assert_ne!(local_key, docker_key);
}

#[test]
fn cache_key_is_stable_across_env_insertion_order() {
    let mut a = sh_process("echo hi");
    let mut env_a = BTreeMap::new();
    env_a.insert("X".to_owned(), "1".to_owned());
    env_a.insert("Y".to_owned(), "2".to_owned());
    a.env = env_a;

    let mut b = sh_process("echo hi");
    let mut env_b = BTreeMap::new();
    env_b.insert("Y".to_owned(), "2".to_owned());
    env_b.insert("X".to_owned(), "1".to_owned());
    b.env = env_b;

    assert_eq!(
        make_execute_request(&a, None, None).unwrap().action_digest,
        make_execute_request(&b, None, None).unwrap().action_digest,
    );
}

#[test]
fn workspace_processes_must_not_be_cacheable() {
    let mut process = sh_process("echo hi");
    process.execution_environment.strategy = ProcessExecutionStrategy::Workspace;
    assert!(process.validate().is_err());

    process.cache_scope = ProcessCacheScope::Never;
    assert!(process.validate().is_ok());
}
