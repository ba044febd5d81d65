// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::time::Duration;

use rand::{Rng, thread_rng};
use tonic::{Code, Status};

/// Transient codes are worth retrying; everything else (InvalidArgument, NotFound,
/// PermissionDenied, ...) is deterministic and is surfaced immediately.
pub fn status_is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Aborted
            | Code::Cancelled
            | Code::DeadlineExceeded
            | Code::Internal
            | Code::ResourceExhausted
            | Code::Unavailable
            | Code::Unknown
    )
}

/// Retries a gRPC client operation with exponential backoff and jitter between attempts.
///
/// The operation receives a fresh clone of `client` per attempt, because tonic clients are
/// cheaply cloneable handles onto a shared channel.
pub async fn retry_call<C, T, E, F, Fut, G>(
    client: C,
    f: F,
    is_retryable: G,
) -> Result<T, E>
where
    C: Clone,
    F: Fn(C, u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    G: Fn(&E) -> bool,
{
    const INTERVAL_DURATION: Duration = Duration::from_millis(20);
    const MAX_RETRIES: u32 = 3;
    const MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);

    let mut num_retries = 0;
    loop {
        if num_retries > 0 {
            // Jittered exponential backoff: a random multiple of the base interval, bounded
            // by the attempt number.
            let multiplier = thread_rng().gen_range(0..2_u32.pow(num_retries) + 1);
            let sleep_time = (INTERVAL_DURATION * multiplier).min(MAX_BACKOFF_DURATION);
            tokio::time::sleep(sleep_time).await;
        }

        match f(client.clone(), num_retries).await {
            Ok(r) => return Ok(r),
            Err(err) if num_retries < MAX_RETRIES && is_retryable(&err) => {
                num_retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tonic::{Code, Status};

    use super::{retry_call, status_is_retryable};

    #[tokio::test]
    async fn retries_transient_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<u32, Status> = retry_call(
            attempts.clone(),
            |attempts, _| async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Status::unavailable("busy"))
                } else {
                    Ok(42)
                }
            },
            status_is_retryable,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_deterministic_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<u32, Status> = retry_call(
            attempts.clone(),
            |attempts, _| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Status::invalid_argument("bad"))
            },
            status_is_retryable,
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<u32, Status> = retry_call(
            attempts.clone(),
            |attempts, _| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Status::unavailable("busy"))
            },
            status_is_retryable,
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
