// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

/// Copies the ambient workunit parent into a spawned task, so that workunits created there
/// attach below the spawner's span.
fn future_with_correct_context<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let workunit_store_handle = spans::get_workunit_store_handle();

    // NB: This function must stay synchronous so that the handle is captured on the spawning
    // thread; only the returned future runs on the spawned task.
    spans::scope_task_workunit_store_handle(workunit_store_handle, future)
}

///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()` or `Self::to_borrowed()`, wrapping an ambient Runtime
///       (usually one owned by the tokio test/main macros). Dropping all clones does not shut
///       the Runtime down.
/// * "owned"
///     * Created with `Self::new_owned()`. The Runtime is shut down when `shutdown` is called
///       (or when the last clone is dropped).
///
/// The blocking pool backs the I/O-heavy intrinsics (store reads, scandirs), keeping them off
/// the worker threads that drive rule bodies.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for an already-running Runtime. The caller is responsible for
    /// keeping that Runtime alive for at least as long as this Executor.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor with an owned Runtime sized to the given worker/blocking thread
    /// counts.
    ///
    pub fn new_owned(
        num_worker_threads: usize,
        max_threads: usize,
    ) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Creates a clone of this Executor which is disconnected from shutdown events.
    ///
    pub fn to_borrowed(&self) -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    ///
    /// Enters the runtime context of this Executor, for threads not started by the runtime
    /// which need access to its task-locals.
    ///
    pub fn enter<F: FnOnce() -> R, R>(&self, f: F) -> R {
        let _context = self.handle.enter();
        f()
    }

    ///
    /// Spawns a Future as a task, recovering from abnormal exits with the given closure.
    ///
    /// Dropping the returned Future does not cancel the task.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Spawns a Future as a task, returning its JoinHandle.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future_with_correct_context(future))
    }

    ///
    /// Runs a Future to completion on this Executor from a non-async context.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future_with_correct_context(future))
    }

    ///
    /// Runs the given closure on the dedicated blocking pool, recovering from abnormal exits
    /// with the given closure.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Runs the given closure on the dedicated blocking pool, returning its JoinHandle.
    ///
    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        let workunit_store_handle = spans::get_workunit_store_handle();
        self.handle.spawn_blocking(move || {
            spans::set_thread_workunit_store_handle(workunit_store_handle);
            f()
        })
    }

    /// A reference to this Executor's runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// Shuts down an "owned" Executor's Runtime, leaking any tasks which do not exit within
    /// the timeout. No-op for "borrowed" Executors.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Returns true if `shutdown` has been called. Always true for borrowed Executors.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::Executor;

    #[tokio::test]
    async fn spawned_task_runs() {
        let executor = Executor::new();
        let value = executor.spawn(async { 42 }, |e| panic!("{e}")).await;
        assert_eq!(42, value);
    }

    #[tokio::test]
    async fn blocking_task_runs() {
        let executor = Executor::new();
        let value = executor
            .spawn_blocking(|| 2 + 2, |e| panic!("{e}"))
            .await;
        assert_eq!(4, value);
    }

    #[test]
    fn owned_executor_shuts_down() {
        let executor = Executor::new_owned(2, 4).unwrap();
        assert!(!executor.is_shutdown());
        executor.shutdown(std::time::Duration::from_secs(5));
        assert!(executor.is_shutdown());
    }
}
