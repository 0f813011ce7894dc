//! Retry helpers shared by all backend calls.
//!
//! Transient failures (network errors, 5xx, 429) are retried after a delay,
//! honoring the backend's suggested Retry-After when present. Exhausted
//! quota blocks and retries on an interval until resolved or cancellation
//! fires; it is never surfaced as a hard failure by itself. Fatal failures
//! (auth, malformed request) abort the current operation only.

use crate::errors::{AppError, AppResult, BackendError, ErrorClass};
use crate::pipeline::control::CancelFlag;
use log::{debug, warn};
use rand::Rng;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

/// Interval between attempts while a quota/balance problem persists.
const QUOTA_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Classify an HTTP response status plus body into a backend error.
pub fn classify_response(status: StatusCode, body: &str, retry_after: Option<Duration>) -> BackendError {
    let message = format!("HTTP {}: {}", status, body);
    let lower = body.to_lowercase();
    let mut err = if status == StatusCode::PAYMENT_REQUIRED
        || lower.contains("insufficient balance")
        || lower.contains("quota exceeded")
    {
        BackendError::quota(message)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::transient(message)
    } else {
        BackendError::fatal(message)
    };
    if let Some(delay) = retry_after {
        err = err.with_retry_after(delay);
    }
    err
}

fn backoff_delay(base: Duration, err: &AppError) -> Duration {
    if let Some(suggested) = err.retry_after() {
        return suggested;
    }
    // Small jitter so workers retrying in lockstep spread out.
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 2);
    base + Duration::from_millis(jitter)
}

/// Retry an operation with a bounded attempt count, for calls inside a
/// time-sensitive wait loop. Cancellation is re-checked between attempts.
pub async fn retry_bounded<T, F, Fut>(
    op_name: &str,
    attempts: usize,
    delay: Duration,
    cancel: &CancelFlag,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut remaining = attempts.max(1);
    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match err.class() {
                ErrorClass::Fatal => return Err(err),
                ErrorClass::QuotaExhausted => {
                    // Quota exhaustion does not consume attempts; block until
                    // it clears or the run is cancelled.
                    warn!("{}: quota exhausted, waiting: {}", op_name, err);
                    tokio::time::sleep(err.retry_after().unwrap_or(QUOTA_RETRY_INTERVAL)).await;
                }
                ErrorClass::Transient => {
                    remaining -= 1;
                    if remaining == 0 {
                        return Err(err);
                    }
                    let wait = backoff_delay(delay, &err);
                    debug!(
                        "{}: transient failure, retrying in {:?} ({} attempts left): {}",
                        op_name, wait, remaining, err
                    );
                    tokio::time::sleep(wait).await;
                }
            },
        }
    }
}

/// Retry a best-effort background operation until it succeeds, fails fatally,
/// or the run is cancelled.
pub async fn retry_until_cancelled<T, F, Fut>(
    op_name: &str,
    interval: Duration,
    cancel: &CancelFlag,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match err.class() {
                ErrorClass::Fatal => return Err(err),
                _ => {
                    let wait = backoff_delay(interval, &err);
                    debug!("{}: retrying in {:?}: {}", op_name, wait, err);
                    tokio::time::sleep(wait).await;
                }
            },
        }
    }
}
