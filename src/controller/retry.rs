//! Deadline-bounded retry loop for the bootstrap trigger
//!
//! Attempts run strictly one after another. Each attempt is bounded by the
//! time left before the deadline, and the wait between attempts never runs
//! past it. When the deadline passes, the last failure is wrapped in
//! `Error::TimeoutError`.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Time reserved for the caller to record the outcome before its own deadline fires
pub const CREATE_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

/// Create timeout used when the caller does not supply one
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Which failures the retry loop absorbs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RetryPolicy {
    /// Retry every failure until the deadline
    #[default]
    RetryAll,
    /// Retry only failures classified as transient; fail fast on the rest
    TransientOnly,
}

impl RetryPolicy {
    pub fn should_retry(&self, error: &Error) -> bool {
        match self {
            RetryPolicy::RetryAll => true,
            RetryPolicy::TransientOnly => error.is_retriable(),
        }
    }
}

/// Retry budget left after reserving the safety margin
pub fn deadline_for(timeout: Duration) -> Duration {
    timeout.saturating_sub(CREATE_TIMEOUT_MARGIN)
}

/// Delay before the next attempt
///
/// `attempt` is 0-indexed. Doubles from 200ms, clamped to [500ms, 10s].
pub fn retry_backoff(attempt: u32) -> Duration {
    let millis = 100_u64.saturating_mul(2_u64.saturating_pow(attempt.saturating_add(1).min(16)));
    Duration::from_millis(millis).clamp(MIN_BACKOFF, MAX_BACKOFF)
}

/// Run `attempt_fn` until it succeeds, the policy refuses a failure, or `budget` elapses
///
/// The closure receives the 1-indexed attempt number. At least one attempt is
/// always made, even with a zero budget.
pub async fn retry_until<T, F, Fut>(budget: Duration, policy: RetryPolicy, mut attempt_fn: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + budget;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());

        let result = if remaining.is_zero() {
            attempt_fn(attempt).await
        } else {
            match timeout(remaining, attempt_fn(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionError {
                    endpoints: "machine API".to_string(),
                    message: format!("attempt {attempt} did not complete before the deadline"),
                }),
            }
        };

        let error = match result {
            Ok(value) => {
                info!("Attempt {} succeeded", attempt);
                return Ok(value);
            }
            Err(e) => e,
        };

        if !policy.should_retry(&error) {
            warn!("Attempt {} failed with non-retriable error: {}", attempt, error);
            return Err(error);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let delay = retry_backoff(attempt - 1);

        if delay >= remaining {
            // no room for another attempt
            sleep(remaining).await;
            warn!(
                "Giving up after {} attempt(s) in {:?}: {}",
                attempt, budget, error
            );
            return Err(Error::TimeoutError {
                timeout: budget,
                attempts: attempt,
                last_error: Box::new(error),
            });
        }

        debug!(
            "Attempt {} failed ({}), retrying in {:?} ({:?} left)",
            attempt, error, delay, remaining
        );
        sleep(delay).await;
    }
}
