// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use testutil::make_file;
use vfs::GitignoreStyleExcludes;

use crate::{Invalidatable, InvalidationWatcher};

struct RecordingInvalidatable {
    invalidated: Mutex<Vec<HashSet<PathBuf>>>,
}

impl RecordingInvalidatable {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            invalidated: Mutex::new(vec![]),
        })
    }

    fn all_paths(&self) -> HashSet<PathBuf> {
        self.invalidated.lock().iter().flatten().cloned().collect()
    }
}

impl Invalidatable for RecordingInvalidatable {
    fn invalidate(&self, paths: &HashSet<PathBuf>, _caller: &str) -> usize {
        self.invalidated.lock().push(paths.clone());
        paths.len()
    }
}

fn send_event(
    sender: &crossbeam_channel::Sender<notify::Result<notify::Event>>,
    path: PathBuf,
) {
    let event = notify::Event::new(notify::EventKind::Modify(
        notify::event::ModifyKind::Data(notify::event::DataChange::Content),
    ))
    .add_path(path);
    sender.send(Ok(event)).unwrap();
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition was not reached");
}

#[tokio::test]
async fn events_are_relativized_and_include_parents() {
    let build_root = tempfile::TempDir::new().unwrap();
    let canonical_root = std::fs::canonicalize(build_root.path()).unwrap();

    let invalidatable = RecordingInvalidatable::new();
    let (event_sender, event_receiver) = unbounded();
    let (liveness_sender, _liveness_receiver) = unbounded();
    let _handle = InvalidationWatcher::start_background_thread(
        Arc::downgrade(&invalidatable),
        GitignoreStyleExcludes::empty(),
        canonical_root.clone(),
        liveness_sender,
        event_receiver,
    );

    send_event(&event_sender, canonical_root.join("src/foo.txt"));

    wait_for(|| !invalidatable.all_paths().is_empty()).await;
    let paths = invalidatable.all_paths();
    assert!(paths.contains(&PathBuf::from("src/foo.txt")), "was: {paths:?}");
    // The parent directory's listing is invalidated alongside the file (S4 relies on the
    // directory node being dirtied too).
    assert!(paths.contains(&PathBuf::from("src")), "was: {paths:?}");
}

#[tokio::test]
async fn ignored_paths_do_not_invalidate() {
    let build_root = tempfile::TempDir::new().unwrap();
    let canonical_root = std::fs::canonicalize(build_root.path()).unwrap();

    let invalidatable = RecordingInvalidatable::new();
    let (event_sender, event_receiver) = unbounded();
    let (liveness_sender, _liveness_receiver) = unbounded();
    let _handle = InvalidationWatcher::start_background_thread(
        Arc::downgrade(&invalidatable),
        GitignoreStyleExcludes::create(vec!["*.tmp".to_owned()]).unwrap(),
        canonical_root.clone(),
        liveness_sender,
        event_receiver,
    );

    send_event(&event_sender, canonical_root.join("scratch.tmp"));
    send_event(&event_sender, canonical_root.join("kept.txt"));

    wait_for(|| !invalidatable.all_paths().is_empty()).await;
    let paths = invalidatable.all_paths();
    assert!(paths.contains(&PathBuf::from("kept.txt")));
    assert!(!paths.contains(&PathBuf::from("scratch.tmp")));
}

#[tokio::test]
async fn thread_exits_when_invalidatable_is_dropped() {
    let build_root = tempfile::TempDir::new().unwrap();
    let canonical_root = std::fs::canonicalize(build_root.path()).unwrap();

    let invalidatable = RecordingInvalidatable::new();
    let (_event_sender, event_receiver) = unbounded();
    let (liveness_sender, liveness_receiver) = unbounded();
    let handle = InvalidationWatcher::start_background_thread(
        Arc::downgrade(&invalidatable),
        GitignoreStyleExcludes::empty(),
        canonical_root,
        liveness_sender,
        event_receiver,
    );

    std::mem::drop(invalidatable);
    handle.join().unwrap();
    assert!(liveness_receiver.try_recv().is_ok());
}

#[tokio::test]
async fn end_to_end_watching_invalidates_touched_files() {
    let build_root = tempfile::TempDir::new().unwrap();
    let file_path = build_root.path().join("watched.txt");
    make_file(&file_path, b"initial", 0o600);

    let invalidatable = RecordingInvalidatable::new();
    let watcher = InvalidationWatcher::new(
        pool::Executor::new(),
        build_root.path().to_owned(),
        GitignoreStyleExcludes::empty(),
    )
    .unwrap();
    watcher.start(&invalidatable);
    watcher
        .watch(std::fs::canonicalize(&file_path).unwrap())
        .await
        .unwrap();
    watcher.is_valid().await.unwrap();

    make_file(&file_path, b"changed", 0o600);

    wait_for(|| {
        invalidatable
            .all_paths()
            .contains(&PathBuf::from("watched.txt"))
    })
    .await;
}
