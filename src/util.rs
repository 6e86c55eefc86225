//! Small shared helpers: monotonic counters and deferred completion.

use crate::error::{BusError, BusResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Monotonic counter for subscription and request identifiers.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A deferred result: the write half completes the read half exactly once.
pub(crate) fn deferred<T>() -> (oneshot::Sender<BusResult<T>>, oneshot::Receiver<BusResult<T>>) {
    oneshot::channel()
}

/// Await a deferred for at most `timeout`.
///
/// A dropped sender or an elapsed deadline both resolve to `on_timeout()`.
pub(crate) async fn bounded<T>(
    rx: oneshot::Receiver<BusResult<T>>,
    timeout: Duration,
    on_timeout: impl FnOnce() -> BusError,
) -> BusResult<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) | Err(_) => Err(on_timeout()),
    }
}
