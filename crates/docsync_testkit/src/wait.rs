//! Polling helpers for state that changes in background tasks.

use std::future::Future;
use std::time::Duration;

/// Default time to wait for background state to settle.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds. Panics after `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {timeout:?}");
}

/// Polls `check` until it returns `Some`, and returns the value. Panics
/// after `timeout`.
pub async fn wait_for<T, F>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let found = tokio::time::timeout(timeout, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    match found {
        Ok(value) => value,
        Err(_) => panic!("value not available within {timeout:?}"),
    }
}

/// Awaits `fut`, panicking if it takes longer than `timeout`.
pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    match tokio::time::timeout(timeout, fut).await {
        Ok(value) => value,
        Err(_) => panic!("future did not complete within {timeout:?}"),
    }
}

/// Keeps sampling `sample` for `duration` and checks `invariant` on every
/// value.
pub async fn check_for<T, S, I>(duration: Duration, mut sample: S, mut invariant: I)
where
    S: FnMut() -> T,
    I: FnMut(&T) -> bool,
    T: std::fmt::Debug,
{
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        let value = sample();
        assert!(invariant(&value), "invariant violated by {value:?}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
