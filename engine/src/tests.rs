// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use solver::DependencyKey;
use spans::Level;
use syncutil::AsyncLatch;
use tempfile::TempDir;
use testutil::make_file;
use vfs::{GlobExpansionConjunction, PathGlobs, StrictGlobMatching};

use crate::context::{Core, CoreOptions, ExecutionStrategyOptions};
use crate::scheduler::{ExecutionRequest, ExecutionTermination, Scheduler};
use crate::session::{Session, SessionValues};
use crate::tasks::{DisplayInfo, Task, Tasks};
use crate::types::{Failure, Key, Params, TypeId, Value, throw};

/// The number of files matching `src/**` in the workspace.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct SourceCount(usize);

/// A product which always fails to compute.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct Doomed;

/// A product which blocks forever, for cancellation tests.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct Stuck;

fn src_globs() -> PathGlobs {
    PathGlobs::new(
        vec!["src/**".to_owned()],
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
}

fn count_sources_task() -> Task {
    Task {
        id: solver::RuleId::new("count_sources"),
        product: TypeId::of::<SourceCount>(),
        dependency_keys: vec![DependencyKey::new_with_params(
            TypeId::of::<cas::Snapshot>(),
            vec![TypeId::of::<PathGlobs>()],
        )],
        func: Arc::new(|context| {
            async move {
                let snapshot = context
                    .get_typed::<cas::Snapshot>(vec![Key::new(src_globs())])
                    .await?;
                Ok(Value::new(SourceCount(snapshot.files.len())))
            }
            .boxed()
        }),
        cacheable: true,
        side_effecting: false,
        display_info: DisplayInfo {
            name: "count_sources".to_owned(),
            desc: Some("Counting sources".to_owned()),
            level: Level::Info,
        },
    }
}

struct TestSetup {
    scheduler: Scheduler,
    build_root: TempDir,
    _cache_root: TempDir,
}

fn setup(extra_tasks: Vec<Task>, queries: Vec<(TypeId, Vec<TypeId>)>) -> Result<TestSetup, String> {
    let _logger = env_logger::try_init();
    let executor = pool::Executor::new_owned(2, 8)?;
    let build_root = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();

    let mut tasks = Tasks::new();
    tasks.add_task(count_sources_task());
    for task in extra_tasks {
        tasks.add_task(task);
    }
    tasks.add_query(TypeId::of::<SourceCount>(), vec![]);
    for (product, params) in queries {
        tasks.add_query(product, params);
    }

    let core = Core::new(
        executor,
        tasks,
        CoreOptions {
            build_root: build_root.path().to_owned(),
            cache_root: cache_root.path().to_owned(),
            ignore_patterns: vec![],
            use_gitignore: false,
            local_store_options: cas::LocalOptions {
                files_max_size_bytes: 16 * 1024 * 1024,
                directories_max_size_bytes: 16 * 1024 * 1024,
                ..cas::LocalOptions::default()
            },
            execution_options: ExecutionStrategyOptions {
                local_parallelism: 2,
                ..ExecutionStrategyOptions::default()
            },
            // Tests invalidate explicitly, for determinism.
            watch_filesystem: false,
            local_cache: true,
            process_cache_namespace: None,
        },
    )?;

    Ok(TestSetup {
        scheduler: Scheduler::new(core),
        build_root,
        _cache_root: cache_root,
    })
}

fn new_session(setup: &TestSetup, build_id: &str) -> Session {
    Session::new(
        setup.scheduler.core.clone(),
        build_id.to_owned(),
        SessionValues::default(),
        AsyncLatch::new(),
        Level::Debug,
    )
}

///
/// Scheduler::execute parks the calling thread, so tests drive it from a scoped thread.
///
fn execute(
    scheduler: &Scheduler,
    session: &Session,
    product: TypeId,
) -> Result<Vec<Result<Value, Failure>>, ExecutionTermination> {
    let request = ExecutionRequest {
        roots: vec![(product, Params::new(vec![]).unwrap())],
        timeout: None,
    };
    std::thread::scope(|scope| {
        scope
            .spawn(|| scheduler.execute(&request, session))
            .join()
            .unwrap()
    })
}

fn source_count(results: Vec<Result<Value, Failure>>) -> usize {
    let value = results.into_iter().next().unwrap().unwrap();
    value.extract::<SourceCount>().unwrap().0
}

#[test]
fn query_computes_through_intrinsics() {
    let setup = setup(vec![], vec![]).unwrap();
    make_file(&setup.build_root.path().join("src/foo.txt"), b"foo", 0o600);
    make_file(&setup.build_root.path().join("src/bar.txt"), b"bar", 0o600);

    let session = new_session(&setup, "run-1");
    let results = execute(&setup.scheduler, &session, TypeId::of::<SourceCount>()).unwrap();
    assert_eq!(source_count(results), 2);
}

#[test]
fn identical_queries_are_deterministic_and_memoised() {
    let setup = setup(vec![], vec![]).unwrap();
    make_file(&setup.build_root.path().join("src/foo.txt"), b"foo", 0o600);

    let session1 = new_session(&setup, "run-1");
    let first = execute(&setup.scheduler, &session1, TypeId::of::<SourceCount>()).unwrap();

    // A second session observes an identical result from the memoised subgraph.
    let session2 = new_session(&setup, "run-2");
    let second = execute(&setup.scheduler, &session2, TypeId::of::<SourceCount>()).unwrap();
    assert_eq!(source_count(first), source_count(second));
}

#[test]
fn touching_a_file_invalidates_dependents() {
    // S4: touching a file under `src/**` after a query whose deps include the glob
    // invalidates the intrinsic node and its transitive dependents.
    let setup = setup(vec![], vec![]).unwrap();
    make_file(&setup.build_root.path().join("src/foo.txt"), b"foo", 0o600);

    let session = new_session(&setup, "run-1");
    let results = execute(&setup.scheduler, &session, TypeId::of::<SourceCount>()).unwrap();
    assert_eq!(source_count(results), 1);

    // Add a file and report the change (as the watcher would).
    make_file(&setup.build_root.path().join("src/new.txt"), b"new", 0o600);
    let invalidated = setup.scheduler.invalidate_paths(&HashSet::from([
        PathBuf::from("src"),
        PathBuf::from("src/new.txt"),
    ]));
    assert!(invalidated > 0);

    let results = execute(&setup.scheduler, &session, TypeId::of::<SourceCount>()).unwrap();
    assert_eq!(source_count(results), 2);
}

#[test]
fn touching_an_unrelated_file_does_not_invalidate() {
    let setup = setup(vec![], vec![]).unwrap();
    make_file(&setup.build_root.path().join("src/foo.txt"), b"foo", 0o600);

    let session = new_session(&setup, "run-1");
    execute(&setup.scheduler, &session, TypeId::of::<SourceCount>()).unwrap();

    let invalidated = setup
        .scheduler
        .invalidate_paths(&HashSet::from([PathBuf::from("unrelated.txt")]));
    assert_eq!(invalidated, 0);
}

#[test]
fn user_errors_propagate_with_frames() {
    let doomed = Task {
        id: solver::RuleId::new("doomed"),
        product: TypeId::of::<Doomed>(),
        dependency_keys: vec![],
        func: Arc::new(|_context| {
            async move { Err(throw("explicitly doomed".to_owned())) }.boxed()
        }),
        cacheable: true,
        side_effecting: false,
        display_info: DisplayInfo {
            name: "doomed".to_owned(),
            desc: Some("Dooming".to_owned()),
            level: Level::Info,
        },
    };
    let setup = setup(vec![doomed], vec![(TypeId::of::<Doomed>(), vec![])]).unwrap();

    let session = new_session(&setup, "run-1");
    let results = execute(&setup.scheduler, &session, TypeId::of::<Doomed>()).unwrap();
    match results.into_iter().next().unwrap() {
        Err(Failure::Throw { val, frames }) => {
            assert_eq!(val, "explicitly doomed");
            assert!(!frames.is_empty());
        }
        other => panic!("Expected a Throw, got: {other:?}"),
    }
}

#[test]
fn missing_rule_fails_scheduler_construction() {
    // A query for a type which no rule produces is fatal at Core construction.
    let result = setup(vec![], vec![(TypeId::of::<Doomed>(), vec![])]);
    let err = result.err().expect("Expected construction to fail");
    assert!(err.contains("No rule was able to compute"), "was: {err}");
}

#[test]
fn cancellation_terminates_execution_promptly() {
    let stuck = Task {
        id: solver::RuleId::new("stuck"),
        product: TypeId::of::<Stuck>(),
        dependency_keys: vec![],
        func: Arc::new(|_context| {
            async move {
                futures::future::pending::<()>().await;
                Ok(Value::new(Stuck))
            }
            .boxed()
        }),
        cacheable: true,
        side_effecting: false,
        display_info: DisplayInfo {
            name: "stuck".to_owned(),
            desc: None,
            level: Level::Debug,
        },
    };
    let setup = setup(vec![stuck], vec![(TypeId::of::<Stuck>(), vec![])]).unwrap();
    let session = new_session(&setup, "run-1");

    let session2 = session.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(200));
        session2.cancel();
    });

    let start = std::time::Instant::now();
    let result = execute(&setup.scheduler, &session, TypeId::of::<Stuck>());
    canceller.join().unwrap();
    assert!(matches!(result, Err(ExecutionTermination::KeyboardInterrupt)));
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn graph_gc_retains_session_roots() {
    let setup = setup(vec![], vec![]).unwrap();
    make_file(&setup.build_root.path().join("src/foo.txt"), b"foo", 0o600);

    let session = new_session(&setup, "run-1");
    execute(&setup.scheduler, &session, TypeId::of::<SourceCount>()).unwrap();
    let len_before = setup.scheduler.core.graph.len();
    assert!(len_before > 0);

    // With the session live, nothing is collected.
    let removed = setup.scheduler.garbage_collect_graph(&[session]);
    assert_eq!(removed, 0);
    assert_eq!(setup.scheduler.core.graph.len(), len_before);

    // With no live sessions, the graph empties.
    let removed = setup.scheduler.garbage_collect_graph(&[]);
    assert_eq!(removed, len_before);
}
