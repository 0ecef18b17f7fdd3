//! Retrying wrapper for remote calls.
//!
//! Every remote invocation in this crate goes through
//! [`RetryingClient::call`]. Transient failures (HTTP 5xx and 429) are
//! retried with a bounded, policy-driven sleep between attempts; anything
//! else is returned to the caller unchanged on the first occurrence.
//!
//! Two policies exist because the observed call sites genuinely diverge:
//! a fixed one-second delay for ordinary listing/status traffic, and a
//! doubling backoff (5s, 10s, 20s, ... capped) for slow membership-style
//! lookups. Call sites choose; there is no unified policy.

use crate::error::RemoteError;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const FIXED_DELAY: Duration = Duration::from_secs(1);
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(160);
const DEFAULT_RETRIES: u32 = 3;

/// How long to wait between attempts, and how many retries to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// A constant delay between attempts.
    FixedDelay { delay: Duration, retries: u32 },
    /// Delay doubles each attempt, starting at `initial`, capped at `cap`.
    ExponentialBackoff {
        initial: Duration,
        cap: Duration,
        retries: u32,
    },
}

impl RetryPolicy {
    /// The policy used for ordinary listing and status traffic: 1s between
    /// attempts.
    pub fn fixed_delay(retries: u32) -> Self {
        RetryPolicy::FixedDelay {
            delay: FIXED_DELAY,
            retries,
        }
    }

    /// The policy used for slow lookups: 5s, 10s, 20s, 40s, 80s, 160s.
    pub fn exponential_backoff(retries: u32) -> Self {
        RetryPolicy::ExponentialBackoff {
            initial: BACKOFF_INITIAL,
            cap: BACKOFF_CAP,
            retries,
        }
    }

    /// Total retries after the initial attempt.
    pub fn retries(&self) -> u32 {
        match *self {
            RetryPolicy::FixedDelay { retries, .. }
            | RetryPolicy::ExponentialBackoff { retries, .. } => retries,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::FixedDelay { delay, .. } => delay,
            RetryPolicy::ExponentialBackoff { initial, cap, .. } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                initial.checked_mul(factor).map_or(cap, |d| d.min(cap))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed_delay(DEFAULT_RETRIES)
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Wraps remote calls with a retry policy.
///
/// The sleep blocks the calling thread; a retry in progress cannot be
/// interrupted mid-sleep. Callers needing cancellation must run the whole
/// call on its own worker.
#[derive(Clone)]
pub struct RetryingClient {
    policy: RetryPolicy,
    sleeper: Sleeper,
}

impl std::fmt::Debug for RetryingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for RetryingClient {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryingClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the sleep implementation. Tests use this to count sleeps
    /// without waiting.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Invoke `f`, retrying while it fails with a transient error (HTTP 5xx
    /// or 429). On exhaustion or on a non-retryable error the last error is
    /// returned unchanged.
    pub fn call<T>(
        &self,
        name: &str,
        f: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        self.call_classified(name, f, RemoteError::is_retryable)
    }

    /// Like [`call`](Self::call), but with a caller-supplied retryability
    /// classification. Network-level errors without a status code are only
    /// retried when the classifier says so.
    pub fn call_classified<T>(
        &self,
        name: &str,
        mut f: impl FnMut() -> Result<T, RemoteError>,
        retryable: impl Fn(&RemoteError) -> bool,
    ) -> Result<T, RemoteError> {
        let retries = self.policy.retries();
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < retries && retryable(&err) => {
                    let remaining = retries - attempt;
                    warn!(call = name, error = %err, remaining, "remote call failed, retrying");
                    (self.sleeper)(self.policy.delay_for(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
