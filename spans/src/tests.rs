// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use crate::{Level, Metric, WorkunitMetadata, WorkunitStore, in_workunit};

#[tokio::test]
async fn workunit_started_and_completed_are_polled() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.init_thread_state(None);

    in_workunit!("compile", Level::Info, |_workunit| async {}).await;

    let (started, completed) = store.latest_workunits(Level::Info);
    assert_eq!(
        vec!["compile"],
        started.iter().map(|wu| wu.name).collect::<Vec<_>>()
    );
    assert_eq!(
        vec!["compile"],
        completed.iter().map(|wu| wu.name).collect::<Vec<_>>()
    );
    assert!(completed[0].time_span().is_some());
}

#[tokio::test]
async fn nested_workunits_record_parents() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.init_thread_state(None);

    in_workunit!("outer", Level::Info, |_outer| async {
        in_workunit!("inner", Level::Info, |_inner| async {}).await
    })
    .await;

    let (started, _completed) = store.latest_workunits(Level::Info);
    let outer = started.iter().find(|wu| wu.name == "outer").unwrap();
    let inner = started.iter().find(|wu| wu.name == "inner").unwrap();
    assert_eq!(inner.parent_ids.as_slice(), &[outer.span_id]);
}

#[tokio::test]
async fn low_level_workunits_are_filtered() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.init_thread_state(None);

    in_workunit!("noisy", Level::Trace, |_workunit| async {}).await;
    in_workunit!("visible", Level::Info, |_workunit| async {}).await;

    let (started, completed) = store.latest_workunits(Level::Info);
    assert_eq!(
        vec!["visible"],
        started.iter().map(|wu| wu.name).collect::<Vec<_>>()
    );
    assert_eq!(
        vec!["visible"],
        completed.iter().map(|wu| wu.name).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn metadata_updates_are_observed_on_completion() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.init_thread_state(None);

    in_workunit!(
        "process",
        Level::Debug,
        desc = Some("Scheduling: thing".to_owned()),
        |workunit| async move {
            workunit.update_metadata(|initial| {
                initial.map(|(m, _level)| {
                    (
                        WorkunitMetadata {
                            desc: Some("Hit: thing".to_owned()),
                            ..m
                        },
                        Level::Info,
                    )
                })
            });
        }
    )
    .await;

    let (_started, completed) = store.latest_workunits(Level::Info);
    assert_eq!(
        Some("Hit: thing".to_owned()),
        completed[0].metadata.as_ref().unwrap().desc
    );
    assert_eq!(Level::Info, completed[0].level);
}

#[tokio::test]
async fn counters_accumulate() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.init_thread_state(None);

    store.increment_counter(Metric::LocalCacheRequests, 2);
    store.increment_counter(Metric::LocalCacheRequests, 1);

    assert_eq!(Some(&3), store.get_metrics().get("local_cache_requests"));
}

#[tokio::test]
async fn blocked_workunits_are_not_straggling_leaves() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.init_thread_state(None);

    let (unblocked_tx, unblocked_rx) = tokio::sync::oneshot::channel::<()>();
    let (blocked_tx, blocked_rx) = tokio::sync::oneshot::channel::<()>();
    let store2 = store.clone();
    let handle = tokio::spawn(crate::scope_task_workunit_store_handle(
        Some(crate::WorkunitStoreHandle {
            store: store2,
            parent_id: None,
        }),
        in_workunit!(
            "blocked",
            Level::Info,
            desc = Some("blocked".to_owned()),
            |workunit| async move {
                let _token = workunit.blocking();
                let _ = blocked_tx.send(());
                let _ = unblocked_rx.await;
            }
        ),
    ));

    let _ = blocked_rx.await;
    assert!(store.straggling_workunits(Duration::ZERO).is_empty());
    let _ = unblocked_tx.send(());
    handle.await.unwrap();
}
