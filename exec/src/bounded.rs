// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use spans::{Level, RunningWorkunit, in_workunit};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::{Context, FallibleProcessResult, Process, ProcessError};

///
/// A CommandRunner wrapper which limits the number of concurrent processes, and provides
/// concurrency information to the processes being executed.
///
/// This semaphore is the sole cross-rule resource gate in the system: every backend runner
/// is wrapped by one sized to the configured local parallelism.
///
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    sema: AsyncSemaphore,
}

impl CommandRunner {
    pub fn new(inner: Box<dyn crate::CommandRunner>, bound: usize) -> CommandRunner {
        CommandRunner {
            inner: inner.into(),
            sema: AsyncSemaphore::new(bound),
        }
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("bounded::CommandRunner")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        process: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        // A process claims `max(1, concurrency_available)` permits, bounded by the total.
        let permits = process
            .concurrency_available
            .clamp(1, self.sema.total_concurrency);

        let semaphore_acquisition = self.sema.acquire(permits);
        let permit = in_workunit!(
            "acquire_command_runner_slot",
            Level::Debug,
            |workunit| async move {
                let _blocking_token = workunit.blocking();
                semaphore_acquisition.await
            }
        )
        .await;

        log::debug!(
            "Running {} under semaphore with concurrency id: {}, and concurrency {}",
            process.description,
            permit.concurrency_slot(),
            permits,
        );

        let mut process = process;
        if let Some(ref execution_slot_env_var) = process.execution_slot_variable {
            process.env.insert(
                execution_slot_env_var.clone(),
                format!("{}", permit.concurrency_slot()),
            );
        }

        self.inner.run(context, workunit, process).await
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.inner.shutdown().await
    }
}

///
/// A wrapped Semaphore which tracks slot ids, so that concurrently-running processes
/// receive disjoint slot indexes (for `execution_slot_variable`).
///
#[derive(Clone)]
pub(crate) struct AsyncSemaphore {
    sema: Arc<Semaphore>,
    available_ids: Arc<Mutex<VecDeque<usize>>>,
    total_concurrency: usize,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> AsyncSemaphore {
        let mut available_ids = VecDeque::new();
        for id in 1..=permits {
            available_ids.push_back(id);
        }

        AsyncSemaphore {
            sema: Arc::new(Semaphore::new(permits)),
            available_ids: Arc::new(Mutex::new(available_ids)),
            total_concurrency: permits,
        }
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.sema.available_permits()
    }

    ///
    /// Acquires the given number of permits (and one slot id).
    ///
    pub async fn acquire(&self, permits: usize) -> Permit<'_> {
        let permit = self
            .sema
            .acquire_many(permits as u32)
            .await
            .expect("the semaphore is never closed");
        let slot = self
            .available_ids
            .lock()
            .pop_front()
            .expect("More permits were distributed than ids exist.");
        Permit {
            _permit: permit,
            available_ids: self.available_ids.clone(),
            slot,
        }
    }
}

pub(crate) struct Permit<'a> {
    _permit: SemaphorePermit<'a>,
    available_ids: Arc<Mutex<VecDeque<usize>>>,
    slot: usize,
}

impl Permit<'_> {
    pub fn concurrency_slot(&self) -> usize {
        self.slot
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.available_ids.lock().push_front(self.slot);
    }
}
