//! Retry, timeout, and reconnect backoff utilities.
//!
//! The helpers in this module are transport-agnostic. `retry_async` bounds
//! short-lived Web API calls, while [`ReconnectBackoff`] paces gateway
//! reconnects for as long as the manager lives.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a conservative default for Web API requests.
    pub fn web_api() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }

    /// Policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::web_api()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Parameters for reconnect pacing.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect after a failure.
    pub baseline: Duration,
    /// Upper bound for any delay, jitter included.
    pub max_delay: Duration,
    /// Fraction of the current delay added as random jitter (0.0 disables it).
    pub jitter_ratio: f64,
    /// A connection that stays up at least this long resets the backoff.
    pub min_dwell: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            baseline: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
            min_dwell: Duration::from_secs(30),
        }
    }
}

/// Exponential, capped, jittered reconnect backoff state.
///
/// Every failed or prematurely terminated connect calls [`next_delay`],
/// doubling the base delay up to the cap. A connection that lasted past the
/// policy's dwell time calls [`reset`] through [`record_session_end`].
///
/// [`next_delay`]: ReconnectBackoff::next_delay
/// [`reset`]: ReconnectBackoff::reset
/// [`record_session_end`]: ReconnectBackoff::record_session_end
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    attempt: u32,
    base: Duration,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let base = policy.baseline;
        Self {
            policy,
            attempt: 0,
            base,
        }
    }

    /// Number of consecutive failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay the next call to [`next_delay`](Self::next_delay)
    /// will start from.
    pub fn current_base(&self) -> Duration {
        self.base
    }

    /// Returns the delay to wait now and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base;
        self.attempt = self.attempt.saturating_add(1);
        self.base = std::cmp::min(base.saturating_mul(2), self.policy.max_delay);

        let jitter_cap = base.mul_f64(self.policy.jitter_ratio.clamp(0.0, 1.0));
        let jittered = base + jitter_duration(jitter_cap, self.attempt as usize);
        jittered.min(self.policy.max_delay.max(base))
    }

    /// Resets the attempt counter and delay to the baseline.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.base = self.policy.baseline;
    }

    /// Resets the backoff when a session survived at least the dwell time.
    ///
    /// Returns `true` when a reset happened.
    pub fn record_session_end(&mut self, lifetime: Duration) -> bool {
        if lifetime >= self.policy.min_dwell {
            self.reset();
            return true;
        }
        false
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
