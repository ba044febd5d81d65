// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use strum_macros::{EnumIter, IntoStaticStr};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    LocalCacheRequests,
    LocalCacheRequestsCached,
    LocalCacheRequestsUncached,
    LocalCacheReadErrors,
    LocalCacheWriteErrors,
    LocalExecutionRequests,
    DockerExecutionRequests,
    DockerExecutionSuccesses,
    DockerExecutionErrors,
    RemoteExecutionRequests,
    RemoteExecutionRpcRetries,
    RemoteExecutionRpcErrors,
    RemoteExecutionSuccess,
    RemoteExecutionTimeouts,
    RemoteCacheRequests,
    RemoteCacheRequestsCached,
    RemoteCacheRequestsUncached,
    RemoteStoreMissingDigest,
    BacktrackAttempts,
    InvalidationEventsDiscarded,
    DownloadAttempts,
    DownloadSuccesses,
    DownloadErrors,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ObservationMetric {
    LocalStoreReadBlobSize,
    LocalStoreReadBlobTimeMicros,
    LocalProcessTimeRunMs,
    LocalCacheTimeSavedMs,
    RemoteProcessTimeRunMs,
    RemoteStoreReadBlobTimeMicros,
    RemoteStoreBlobBytesUploaded,
    RemoteStoreBlobBytesDownloaded,
}
