//! Bounded timeouts and exponential backoff for external calls.
//!
//! Every call a worker makes to object storage, OCR, the keyed store, the
//! index, or a stream goes through [`retry`]:
//! - each attempt is bounded by the policy's call timeout (if set)
//! - transient errors (timeouts, throttling, 5xx) are retried
//! - permanent and fatal errors return immediately
//! - backoff: `base * 2^attempt`, capped at `max_delay`

use std::future::Future;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// A policy that never retries. Handy in tests.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Bound a single future by `timeout`, mapping expiry to [`PipelineError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            operation: operation.to_string(),
            elapsed: timeout,
        }),
    }
}

/// Run `op` under `policy`, retrying transient failures.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match policy.call_timeout {
            Some(timeout) => with_timeout(operation, timeout, op()).await,
            None => op().await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry(&fast_policy(3), "flaky", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PipelineError::transient("flaky", "503"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: PipelineResult<()> = retry(&fast_policy(3), "bad", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::permanent("bad", "not an image"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: PipelineResult<()> = retry(&fast_policy(2), "down", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::transient("down", "connection refused"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hung_call_is_bounded_by_call_timeout() {
        let policy = RetryPolicy::none().with_call_timeout(Duration::from_millis(20));
        let result: PipelineResult<()> = retry(&policy, "hang", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Timeout { .. })));
    }
}
