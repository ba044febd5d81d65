// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fingerprint::Digest;
use spans::Metric;

use crate::context::Core;
use crate::nodes::NodeResult;
use crate::types::throw;

const MAX_ATTEMPTS: u32 = 4;

///
/// Downloads the file at the given URL, verifies it against the expected digest, stores it,
/// and snapshots it under the URL's file name.
///
/// The store is consulted first: a file which has already been downloaded (by any prior
/// session) is never re-fetched.
///
pub(crate) async fn download_and_snapshot(
    core: Arc<Core>,
    url: String,
    expected_digest: Digest,
) -> NodeResult<cas::Snapshot> {
    let file_name = url::Url::parse(&url)
        .map_err(|err| throw(format!("Failed to parse URL {url:?}: {err}")))?
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(str::to_owned)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| throw(format!("The URL {url:?} did not name a file.")))?;

    // If the store already has the content, the download is skipped entirely.
    if core.store.ensure_local_has_file(expected_digest).await.is_err() {
        let bytes = fetch_with_retries(&core, &url).await?;
        let actual_digest = Digest::of_bytes(&bytes);
        if actual_digest != expected_digest {
            return Err(throw(format!(
                "Wrong digest for downloaded file {url:?}: want {expected_digest:?} but got \
         {actual_digest:?}"
            )));
        }
        core.store
            .store_file_bytes(bytes, true)
            .await
            .map_err(throw)?;
    }

    cas::Snapshot::of_one_file(
        core.store.clone(),
        std::path::PathBuf::from(file_name),
        expected_digest,
        false,
    )
    .await
    .map_err(throw)
}

async fn fetch_with_retries(core: &Arc<Core>, url: &str) -> NodeResult<Bytes> {
    let client = reqwest::Client::new();
    let workunit_store = spans::get_workunit_store_handle().map(|handle| handle.store);

    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(store) = &workunit_store {
            store.increment_counter(Metric::DownloadAttempts, 1);
        }

        match fetch_once(&client, url).await {
            Ok(bytes) => {
                if let Some(store) = &workunit_store {
                    store.increment_counter(Metric::DownloadSuccesses, 1);
                }
                return Ok(bytes);
            }
            Err(FetchError::Permanent(err)) => {
                if let Some(store) = &workunit_store {
                    store.increment_counter(Metric::DownloadErrors, 1);
                }
                return Err(throw(err));
            }
            Err(FetchError::Transient(err)) if attempt < MAX_ATTEMPTS => {
                log::debug!("Retrying download of {url} after: {err}");
                // Exponential backoff between retry attempts.
                tokio::time::sleep(Duration::from_millis(100 * 2_u64.pow(attempt))).await;
            }
            Err(FetchError::Transient(err)) => {
                if let Some(store) = &workunit_store {
                    store.increment_counter(Metric::DownloadErrors, 1);
                }
                return Err(throw(format!(
                    "Failed to download {url} after {MAX_ATTEMPTS} attempts: {err}"
                )));
            }
        }
    }
}

enum FetchError {
    Transient(String),
    Permanent(String),
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<Bytes, FetchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| FetchError::Transient(format!("Error downloading file: {err}")))?;

    let status = response.status();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::Transient(format!(
            "Server error ({status}) downloading file"
        )));
    }
    if !status.is_success() {
        return Err(FetchError::Permanent(format!(
            "Error ({status}) downloading file from {url}"
        )));
    }

    response
        .bytes()
        .await
        .map_err(|err| FetchError::Transient(format!("Error reading download body: {err}")))
}
