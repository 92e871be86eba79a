//! ABOUTME: Exponential backoff with full jitter for transient provider errors
//! ABOUTME: Only QTypeError::Transient is retried; everything else surfaces at once

use crate::options::RetryOptions;
use qtype_core::{QTypeError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Cancellation interrupts both the operation and any backoff sleep. When
/// attempts are exhausted, the last transient error is returned for the
/// caller to convert into a message failure.
pub async fn retry_transient<T, F, Fut>(
    options: &RetryOptions,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = options.max_attempts.max(1);
    let mut last_error = QTypeError::transient("retry loop did not run");

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(QTypeError::Cancelled);
        }
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(QTypeError::Cancelled),
            outcome = op() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = jittered(options, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient error, backing off");
                last_error = err;
                tokio::select! {
                    () = cancel.cancelled() => return Err(QTypeError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error)
}

fn jittered(options: &RetryOptions, attempt: usize) -> Duration {
    let backoff = options.backoff(attempt);
    if options.jitter && backoff > Duration::ZERO {
        let millis = backoff.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    } else {
        backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_options(attempts: usize) -> RetryOptions {
        RetryOptions {
            max_attempts: attempts,
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 5,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient(&fast_options(3), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(QTypeError::transient("rate limited"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_cap() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient(&fast_options(3), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QTypeError::transient("always down")) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient(&fast_options(5), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QTypeError::fatal("broken config")) }
        })
        .await;
        assert!(matches!(result.unwrap_err(), QTypeError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = retry_transient(&fast_options(3), &cancel, || async {
            Err(QTypeError::transient("down"))
        })
        .await;
        assert!(matches!(result.unwrap_err(), QTypeError::Cancelled));
    }
}
