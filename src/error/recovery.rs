//! Timeout and retry helpers
//!
//! Neither helper is applied automatically by the orchestrator beyond the
//! per-engine timeout; retry is always the caller's choice.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::OcrError;

/// Race `operation` against a timer.
///
/// On expiry the operation is dropped (cancelling it) and `OCR_TIMEOUT` is
/// returned carrying `name` and the limit.
pub async fn with_timeout<T, F>(operation: F, limit: Duration, name: &str) -> Result<T, OcrError>
where
    F: Future<Output = Result<T, OcrError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} timed out after {:?}", name, limit);
            Err(OcrError::timeout(name, limit.as_millis() as u64))
        }
    }
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, saturating
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Run `operation` up to `max_attempts` times.
///
/// Only errors flagged recoverable are retried; anything else is returned
/// immediately without consuming another attempt. Between attempts the task
/// sleeps for [`backoff_delay`].
pub async fn retry_with_backoff<T, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, OcrError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OcrError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_recoverable() => {
                debug!("Not retrying non-recoverable error {}", err.code());
                return Err(err);
            }
            Err(err) if attempt + 1 >= max_attempts => {
                warn!("Giving up after {} attempts: {}", attempt + 1, err.code());
                return Err(err);
            }
            Err(err) => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    "Attempt {} failed with {}, retrying in {:?}",
                    attempt + 1,
                    err.code(),
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
