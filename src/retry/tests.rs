use super::*;
use crate::error::TransferError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn transient() -> TransferError {
    TransferError::database(Some(40501), "service busy")
}

#[tokio::test(start_paused = true)]
async fn transient_failures_succeed_on_third_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::default();

    let started = tokio::time::Instant::now();
    let counter = calls.clone();
    let result = policy
        .run("test command", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 2^1 + 2^2 seconds of backoff.
    assert_eq!(started.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn transient_exhaustion_returns_the_last_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::default();

    let counter = calls.clone();
    let result: Result<(), _> = policy
        .run("test command", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_transient_errors_are_never_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::default();

    let counter = calls.clone();
    let result: Result<(), _> = policy
        .run("test command", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::database(Some(547), "constraint violation"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn success_needs_no_retry() {
    let policy = RetryPolicy::default();
    let result = policy.run("test command", || async { Ok(7u32) }).await;
    assert_eq!(result.unwrap(), 7);
}
