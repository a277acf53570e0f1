//! Retry policy and backoff computation.
//!
//! A [`RetryPolicy`] decides whether a failed operation may run again and
//! how long to sleep before it does. Only transport and timeout errors are
//! retriable; everything else propagates immediately. The first retry
//! sleeps zero, normal backoff applies from the second on.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Backoff shape for the delay before retry `n` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Never sleep.
    None,
    /// Sleep a fixed delay.
    Constant(Duration),
    /// `base · 2^(n-1)`, capped.
    Exponential { base: Duration, cap: Duration },
    /// Uniform in `[0, min(cap, base · 2^(n-1))]`.
    FullJitter { base: Duration, cap: Duration },
    /// Uniform in `[d/2, d]` where `d = min(cap, base · 2^(n-1))`.
    EqualJitter { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before retry `attempt` (1-based). Attempt 1 sleeps zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match *self {
            Self::None => Duration::ZERO,
            Self::Constant(delay) => delay,
            Self::Exponential { base, cap } => exponential(base, cap, attempt),
            Self::FullJitter { base, cap } => {
                let max = exponential(base, cap, attempt);
                random_in(Duration::ZERO, max)
            }
            Self::EqualJitter { base, cap } => {
                let d = exponential(base, cap, attempt);
                random_in(d / 2, d)
            }
        }
    }
}

/// `min(cap, base · 2^(attempt-1))`, saturating.
fn exponential(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let scaled = match base_ms.checked_shl(attempt - 1) {
        Some(ms) => ms,
        None => u64::MAX,
    };
    Duration::from_millis(scaled).min(cap)
}

fn random_in(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let ms = rand::thread_rng().gen_range(low.as_millis() as u64..=high.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Callback invoked after each retriable failure, before the next attempt.
pub type OnRetry = Arc<dyn Fn(&Error, u32) + Send + Sync>;

/// Decides whether and how a failed operation is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    on_retry: Option<OnRetry>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "…"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_retries(1)
    }
}

impl RetryPolicy {
    /// `max_retries` attempts after the first, exponential backoff from
    /// 25ms capped at 1s.
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(25),
                cap: Duration::from_secs(1),
            },
            on_retry: None,
        }
    }

    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            on_retry: None,
        }
    }

    /// Never retry.
    pub fn disabled() -> Self {
        Self::new(0, Backoff::None)
    }

    pub fn with_callback(mut self, on_retry: OnRetry) -> Self {
        self.on_retry = Some(on_retry);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// True when `err` may be retried and the attempt budget allows it.
    pub fn should_retry(&self, err: &Error, attempts: u32) -> bool {
        err.is_retriable() && attempts <= self.max_retries
    }

    /// Sleep for the backoff of retry `attempt` and fire the callback.
    pub async fn pause(&self, err: &Error, attempt: u32) {
        let delay = self.backoff.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(cb) = &self.on_retry {
            cb(err, attempt);
        }
    }

    /// Run `op`, retrying transient failures per this policy.
    ///
    /// `op` is invoked fresh for each attempt; anything the future borrows
    /// must be owned by the closure (clone in, or use shared handles).
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempts += 1;
                    if !self.should_retry(&err, attempts) {
                        return Err(err);
                    }
                    tracing::debug!(attempt = attempts, error = %err, "retrying after transient failure");
                    self.pause(&err, attempts).await;
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
