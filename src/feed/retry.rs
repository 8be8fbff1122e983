use crate::config::RetryPolicy;
use crate::core::{LedgerError, Result};
use std::future::Future;
use tokio::time::{Duration, sleep, timeout};
use tracing::warn;

/// Runs a feed call under a per-attempt timeout, retrying transient failures.
///
/// A timed-out attempt counts as transient. Non-transient errors and the last
/// attempt's error are returned as is.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    request_timeout: Duration,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match timeout(request_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Transient(format!(
                "{} timed out after {}ms",
                operation,
                request_timeout.as_millis()
            ))),
        };

        match outcome {
            Err(err) if err.is_transient() && attempt < attempts => {
                let backoff_ms = policy.backoff_ms(attempt);
                warn!(operation, attempt, backoff_ms, error = %err, "feed call failed, retrying");
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            other => return other,
        }
    }
}
