// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use cas::{Store, StoreError};
use kvstore::{DEFAULT_LEASE_TIME, ShardedLmdb};
use log::{debug, warn};
use prost::Message;
use reapi::MessageExt;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;
use spans::{Level, Metric, ObservationMetric, RunningWorkunit, WorkunitMetadata, in_workunit};

use crate::{
    Context, FallibleProcessResult, Process, ProcessError, ProcessResultSource,
    make_execute_request, populate_fallible_execution_result,
};

///
/// The persistent process ("action") cache: terminal process results keyed by the digest of
/// their canonical REAPI Action serialisation, stored as `ExecuteResponse` protos in the
/// `processes/` LMDB namespace.
///
#[derive(Clone)]
pub struct PersistentCache {
    inner: Arc<ShardedLmdb>,
}

impl PersistentCache {
    pub fn new(
        cache_root: PathBuf,
        max_size_bytes: usize,
        executor: pool::Executor,
        shard_count: u8,
    ) -> Result<PersistentCache, String> {
        Ok(PersistentCache {
            inner: Arc::new(ShardedLmdb::new(
                cache_root.join("processes"),
                max_size_bytes,
                executor,
                DEFAULT_LEASE_TIME,
                shard_count,
            )?),
        })
    }

    pub async fn load(&self, key: fingerprint::Digest) -> Result<Option<Bytes>, String> {
        self.inner
            .load_bytes_with(key.hash, |bytes| Ok(Bytes::copy_from_slice(bytes)))
            .await
    }

    pub async fn store(&self, key: fingerprint::Digest, value: Bytes) -> Result<(), String> {
        self.inner.store_bytes(key.hash, value, true).await?;
        Ok(())
    }
}

///
/// A CommandRunner wrapper which caches terminal process results per the Process's cache
/// scope: `Successful` results only when the exit code is zero, `Always` results
/// unconditionally, and everything else not at all.
///
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    cache: PersistentCache,
    file_store: Store,
    cache_read: bool,
    process_cache_namespace: Option<String>,
}

impl CommandRunner {
    pub fn new(
        inner: Arc<dyn crate::CommandRunner>,
        cache: PersistentCache,
        file_store: Store,
        cache_read: bool,
        process_cache_namespace: Option<String>,
    ) -> CommandRunner {
        CommandRunner {
            inner,
            cache,
            file_store,
            cache_read,
            process_cache_namespace,
        }
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("cache::CommandRunner")
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
        req: Process,
    ) -> Result<FallibleProcessResult, ProcessError> {
        let cache_scope = req.cache_scope;
        let write_failures_to_cache = cache_scope == crate::ProcessCacheScope::Always;
        let key = make_execute_request(&req, None, self.process_cache_namespace.clone())?
            .action_digest;

        if self.cache_read && !matches!(cache_scope, crate::ProcessCacheScope::Never) {
            let context2 = context.clone();
            let environment = req.execution_environment.clone();
            let cache_read_result = in_workunit!(
                "local_cache_read",
                Level::Trace,
                desc = Some(format!("Local cache lookup: {}", req.description)),
                |workunit| async move {
                    workunit.increment_counter(Metric::LocalCacheRequests, 1);

                    match self.lookup(&context2, key, environment).await {
                        Ok(Some(result)) if result.exit_code == 0 || write_failures_to_cache => {
                            workunit.increment_counter(Metric::LocalCacheRequestsCached, 1);
                            if let Some(time_saved) = result.metadata.saved_by_cache {
                                let time_saved_ms = time_saved.as_millis() as u64;
                                context2.workunit_store.record_observation(
                                    ObservationMetric::LocalCacheTimeSavedMs,
                                    time_saved_ms,
                                );
                            }
                            // On a hit, the workunit's description changes and its level
                            // rises (though not enough to log by default).
                            workunit.update_metadata(|initial| {
                                initial.map(|(initial, _)| {
                                    (
                                        WorkunitMetadata {
                                            desc: initial
                                                .desc
                                                .as_ref()
                                                .map(|desc| format!("Hit: {desc}")),
                                            ..initial
                                        },
                                        Level::Debug,
                                    )
                                })
                            });
                            Ok(result)
                        }
                        Err(err) => {
                            debug!(
                                "Error loading process execution result from local cache: {err} \
                 - continuing to execute"
                            );
                            workunit.increment_counter(Metric::LocalCacheReadErrors, 1);
                            // Fall through to re-execute.
                            Err(())
                        }
                        Ok(_) => {
                            // Either a miss, or a hit for a failing result.
                            workunit.increment_counter(Metric::LocalCacheRequestsUncached, 1);
                            Err(())
                        }
                    }
                }
            )
            .await;

            if let Ok(result) = cache_read_result {
                return Ok(result);
            }
        }

        let result = self.inner.run(context.clone(), workunit, req).await?;
        if cache_scope.persistent_cacheable(result.exit_code) {
            let result = result.clone();
            in_workunit!("local_cache_write", Level::Trace, |workunit| async move {
                if let Err(err) = self.store(key, &result).await {
                    warn!(
                        "Error storing process execution result to local cache: {err} - ignoring \
             and continuing"
                    );
                    workunit.increment_counter(Metric::LocalCacheWriteErrors, 1);
                }
            })
            .await;
        }
        Ok(result)
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.inner.shutdown().await
    }
}

impl CommandRunner {
    async fn lookup(
        &self,
        context: &Context,
        action_key: fingerprint::Digest,
        environment: crate::ProcessExecutionEnvironment,
    ) -> Result<Option<FallibleProcessResult>, StoreError> {
        let cache_lookup_start = Instant::now();

        let Some(bytes) = self.cache.load(action_key).await? else {
            return Ok(None);
        };
        let execute_response = remexec::ExecuteResponse::decode(&bytes[..])
            .map_err(|e| format!("Invalid ExecuteResponse: {e:?}"))?;
        let Some(ref action_result) = execute_response.result else {
            return Err("action result missing from ExecuteResponse".to_owned().into());
        };

        let mut result = populate_fallible_execution_result(
            self.file_store.clone(),
            context.run_id,
            action_result,
            true,
            ProcessResultSource::HitLocally,
            environment,
        )
        .await?;

        // Verify that the output content still exists locally before claiming a hit: GC may
        // have collected it since the result was cached.
        if let Err(err) = self
            .file_store
            .ensure_local_has_recursive_directory(result.output_directory.clone())
            .await
        {
            debug!("Cached result for {action_key:?} was missing content: {err}");
            return Ok(None);
        }

        result
            .metadata
            .update_cache_hit_elapsed(cache_lookup_start.elapsed());
        Ok(Some(result))
    }

    async fn store(
        &self,
        action_key: fingerprint::Digest,
        result: &FallibleProcessResult,
    ) -> Result<(), StoreError> {
        // The process output must be persisted before the pointer to it is.
        self.file_store
            .record_digest_trie(
                result
                    .output_directory
                    .tree
                    .clone()
                    .ok_or_else(|| "Output directory tree was not in memory".to_owned())?,
                true,
            )
            .await?;

        let action_result = remexec::ActionResult {
            exit_code: result.exit_code,
            output_directories: vec![remexec::OutputDirectory {
                path: String::new(),
                tree_digest: Some((&result.output_directory.as_digest()).into()),
                is_topologically_sorted: false,
            }],
            stdout_digest: Some((&result.stdout_digest).into()),
            stderr_digest: Some((&result.stderr_digest).into()),
            execution_metadata: None,
            ..remexec::ActionResult::default()
        };
        let execute_response = remexec::ExecuteResponse {
            cached_result: true,
            result: Some(action_result),
            ..remexec::ExecuteResponse::default()
        };

        self.cache
            .store(action_key, execute_response.to_bytes())
            .await?;
        Ok(())
    }
}
