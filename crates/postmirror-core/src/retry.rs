//! Sequential retry loop shared by both read origins

use std::future::Future;
use std::time::Duration;

use crate::classify::{backoff_delay, classify, ClassifiedError, Origin};
use crate::config::RuntimeConfig;
use crate::util::duration_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_attempts: if config.max_retries == 0 {
                1
            } else {
                config.max_retries
            },
            base_delay: config.retry_base_delay(),
            max_delay: config.max_retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts the attempt budget. Sleeps [`backoff_delay`] between attempts.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    origin: Origin,
    label: &str,
    mut operation: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let classified = classify(&error, origin);
                if !classified.retryable || attempt >= policy.max_attempts {
                    tracing::debug!(
                        %origin,
                        operation = label,
                        attempt,
                        kind = classified.kind.label(),
                        "Giving up on operation"
                    );
                    return Err(classified);
                }
                let delay =
                    backoff_delay(attempt, policy.base_delay, policy.max_delay, Some(&classified));
                tracing::warn!(
                    %origin,
                    operation = label,
                    attempt,
                    delay_ms = duration_millis(delay),
                    error = %classified,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::classify::ErrorKind;
    use crate::error::{Error, SourceError, StoreError};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&policy(3), Origin::Source, "list", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Source(SourceError::Network("reset".into())))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_attempt_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&policy(2), Origin::Mirror, "query", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Store(StoreError::Other("socket timeout".into())))
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Unavailable);
        assert_eq!(error.origin, Origin::Mirror);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&policy(5), Origin::Mirror, "get", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Store(StoreError::NotFound("n1".into())))
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_retries_still_allows_one_attempt() {
        let config = RuntimeConfig {
            max_retries: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
