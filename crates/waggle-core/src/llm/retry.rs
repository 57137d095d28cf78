//! Bounded retry with exponential backoff for LLM calls.
//!
//! Up to three attempts, 1s/2s/4s between them, retrying only errors the
//! classifier marks transient. The wait is a stoppable sleep raced against
//! the cancellation token, so a shutdown never waits out a backoff.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::errors::{classify_message, ErrorClass};

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);

pub async fn with_retry<T, F, Fut>(cancel: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(anyhow!("cancelled"));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retryable = classify_message(&e.to_string()) == ErrorClass::Retryable;
                let attempts_left = attempt + 1 < MAX_ATTEMPTS;
                if !retryable || !attempts_left {
                    return Err(e);
                }

                let delay = BASE_DELAY * 2u32.pow(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient LLM error, backing off"
                );
                last_err = Some(e);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(anyhow!("cancelled")),
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("retry budget exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let cancel = CancellationToken::new();

        let result = with_retry(&cancel, move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("connection reset by peer"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let cancel = CancellationToken::new();

        let result: Result<u32> = with_retry(&cancel, move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("invalid api key"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhausts_after_three_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let cancel = CancellationToken::new();

        let result: Result<u32> = with_retry(&cancel, move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("status 529 overloaded"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<u32> = with_retry(&cancel, || async { Ok(1) }).await;
        assert!(result.is_err());
    }
}
