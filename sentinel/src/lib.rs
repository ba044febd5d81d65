// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The invalidation watcher: consumes native filesystem events and reports the affected
//! workspace-relative paths to an `Invalidatable` (in practice: the engine's graph).

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, trace, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use vfs::GitignoreStyleExcludes;

/// The window within which raw events are coalesced before being delivered.
const COALESCE_WINDOW: Duration = Duration::from_millis(50);

///
/// An InvalidationWatcher maintains a thread that receives events from a `notify` watcher.
///
/// If the background thread exits for any reason, `is_valid` will return an error and the
/// caller should either recreate the watcher or degrade to always-invalidate mode (see
/// `WatchMode`). The thread watches a `Weak` handle to the Invalidatable, and exits once the
/// Invalidatable is dropped.
///
pub struct InvalidationWatcher(Mutex<Inner>);

struct Inner {
    watcher: RecommendedWatcher,
    executor: pool::Executor,
    liveness: Receiver<String>,
    // Until the background thread has started, contains the inputs to launch it. The
    // decoupling of creating and starting the watcher exists to allow the background thread
    // to be tested in isolation.
    background_task_inputs: Option<WatcherTaskInputs>,
}

type WatcherTaskInputs = (
    Arc<GitignoreStyleExcludes>,
    PathBuf,
    crossbeam_channel::Sender<String>,
    Receiver<notify::Result<notify::Event>>,
);

///
/// Whether native watching is available. On unsupported filesystems (network mounts, some
/// containers) the watcher degrades to `Disabled`, and the scheduler must treat every
/// session start as a full invalidation of filesystem-dependent nodes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchMode {
    Enabled,
    Disabled,
}

impl InvalidationWatcher {
    pub fn new(
        executor: pool::Executor,
        build_root: PathBuf,
        ignorer: Arc<GitignoreStyleExcludes>,
    ) -> Result<Arc<InvalidationWatcher>, String> {
        // Watch event paths are canonical. If the build root contains a symlink, event
        // paths would not have the build root as a prefix and the relativization below
        // would miss them, so the build root is canonicalized here once.
        let canonical_build_root = std::fs::canonicalize(build_root.as_path())
            .map_err(|e| format!("Failed to canonicalize build root: {e:?}"))?;

        let (watch_sender, watch_receiver) = crossbeam_channel::unbounded();
        let watcher = RecommendedWatcher::new(
            move |ev| {
                if watch_sender.send(ev).is_err() {
                    // The event thread shutting down first is fine: it exits when the
                    // Invalidatable is dropped.
                    debug!("Watch thread has shutdown, but Watcher is still running.");
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| format!("Failed to begin watching the filesystem: {e}"))?;

        let (liveness_sender, liveness_receiver) = crossbeam_channel::unbounded();

        Ok(Arc::new(InvalidationWatcher(Mutex::new(Inner {
            watcher,
            executor,
            liveness: liveness_receiver,
            background_task_inputs: Some((
                ignorer,
                canonical_build_root,
                liveness_sender,
                watch_receiver,
            )),
        }))))
    }

    ///
    /// Starts the background thread that monitors watch events. Panics if called more than
    /// once.
    ///
    pub fn start<I: Invalidatable>(&self, invalidatable: &Arc<I>) {
        let mut inner = self.0.lock();
        let (ignorer, canonical_build_root, liveness_sender, watch_receiver) = inner
            .background_task_inputs
            .take()
            .expect("An InvalidationWatcher can only be started once.");

        InvalidationWatcher::start_background_thread(
            Arc::downgrade(invalidatable),
            ignorer,
            canonical_build_root,
            liveness_sender,
            watch_receiver,
        );
    }

    // Public for testing purposes.
    pub fn start_background_thread<I: Invalidatable>(
        invalidatable: Weak<I>,
        ignorer: Arc<GitignoreStyleExcludes>,
        canonical_build_root: PathBuf,
        liveness_sender: crossbeam_channel::Sender<String>,
        watch_receiver: Receiver<notify::Result<notify::Event>>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("fs-watcher".to_owned())
            .spawn(move || {
                let exit_msg = loop {
                    let event_res = watch_receiver.recv_timeout(Duration::from_millis(10));
                    let Some(invalidatable) = invalidatable.upgrade() else {
                        // The Invalidatable was dropped: we're done.
                        break "The watcher was shut down.".to_string();
                    };
                    match event_res {
                        Ok(Ok(ev)) => {
                            // Coalesce any events raised within the debounce window into
                            // a single invalidation batch.
                            let mut events = vec![ev];
                            while let Ok(Ok(ev)) = watch_receiver.recv_timeout(COALESCE_WINDOW)
                            {
                                events.push(ev);
                            }

                            let paths: HashSet<_> = events
                                .into_iter()
                                .flat_map(|ev| ev.paths)
                                .filter_map(|path| {
                                    // Relativize paths to the build root.
                                    let path_rel =
                                        match path.strip_prefix(&canonical_build_root) {
                                            Ok(path_rel) => path_rel.to_path_buf(),
                                            // An event outside of the build root: ignore.
                                            Err(_) => return None,
                                        };
                                    // To avoid stat'ing paths for events we will ignore
                                    // anyway, we claim that no path is a directory. At
                                    // worst this produces a false negative for a
                                    // directory-only ignore pattern, and the resulting
                                    // extra invalidation matches nothing.
                                    if ignorer.is_ignored_or_child_of_ignored_path(
                                        &path_rel, /* is_dir */ false,
                                    ) {
                                        trace!("watcher ignoring {path_rel:?}");
                                        None
                                    } else {
                                        Some(path_rel)
                                    }
                                })
                                .flat_map(|path_rel| {
                                    // The parent directory's listing also changed.
                                    let mut paths_to_invalidate: Vec<PathBuf> = vec![];
                                    if let Some(parent_dir) = path_rel.parent() {
                                        paths_to_invalidate.push(parent_dir.to_path_buf());
                                    }
                                    paths_to_invalidate.push(path_rel);
                                    paths_to_invalidate
                                })
                                .collect();

                            if !paths.is_empty() {
                                debug!("watcher invalidating {paths:?}");
                                invalidatable.invalidate(&paths, "watcher");
                            }
                        }
                        Ok(Err(err)) => {
                            if let notify::ErrorKind::PathNotFound = err.kind {
                                warn!("Path(s) did not exist: {:?}", err.paths);
                            } else {
                                break format!("Watch error: {err}");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => (),
                        Err(RecvTimeoutError::Disconnected) => {
                            break "The watch provider exited.".to_owned();
                        }
                    }
                };

                // Log and send the exit condition.
                warn!("File watcher exiting with: {exit_msg}");
                let _ = liveness_sender.send(exit_msg);
            })
            .expect("Failed to spawn the fs-watcher thread")
    }

    ///
    /// An InvalidationWatcher never restarts on its own: a consumer observing an error here
    /// should either re-initialize, or degrade to always-invalidate mode.
    ///
    pub async fn is_valid(&self) -> Result<(), String> {
        let watcher = self.0.lock();
        match watcher.liveness.try_recv() {
            Ok(msg) => {
                // The background thread set the exit condition.
                Err(msg)
            }
            Err(TryRecvError::Disconnected) => Err(
                "The filesystem watcher exited abnormally: please see the log for more information."
                    .to_owned(),
            ),
            Err(TryRecvError::Empty) => {
                // Still alive.
                Ok(())
            }
        }
    }

    ///
    /// Adds a path to the watched set, non-recursively.
    ///
    pub async fn watch(self: &Arc<Self>, path: PathBuf) -> Result<(), notify::Error> {
        let executor = {
            let inner = self.0.lock();
            inner.executor.clone()
        };

        let watcher = self.clone();
        executor
            .spawn_blocking(
                move || {
                    let mut inner = watcher.0.lock();
                    inner.watcher.watch(&path, RecursiveMode::NonRecursive)
                },
                |e| Err(notify::Error::generic(&format!("Watch task failed: {e}"))),
            )
            .await
    }
}

pub trait Invalidatable: Send + Sync + 'static {
    fn invalidate(&self, paths: &HashSet<PathBuf>, caller: &str) -> usize;
}
