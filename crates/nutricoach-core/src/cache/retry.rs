//! Retry policies and the retry loop shared by queries and mutations.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::api::NormalizedError;
use crate::cancel::CancelToken;

/// Attempt cap for queries.
const QUERY_MAX_ATTEMPTS: u32 = 3;

/// Mutations are side-effecting and not generally idempotent: one attempt.
const MUTATION_MAX_ATTEMPTS: u32 = 1;

/// First backoff delay in milliseconds; doubles per failure.
const BASE_DELAY_MS: u64 = 1000;

/// Backoff ceiling in milliseconds.
const MAX_DELAY_MS: u64 = 30_000;

type RetryPredicate = dyn Fn(&NormalizedError) -> bool + Send + Sync;

/// Whether and how long to wait before re-attempting a failed operation.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    is_retryable: Arc<RetryPredicate>,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// Retry up to `max_attempts` total attempts, gated by `NormalizedError::retryable`.
    /// A cap of 0 still performs the single initial attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            is_retryable: Arc::new(|e: &NormalizedError| e.retryable),
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_DELAY_MS),
            jitter: false,
        }
    }

    pub fn query_default() -> Self {
        Self::new(QUERY_MAX_ATTEMPTS)
    }

    pub fn mutation_default() -> Self {
        Self::new(MUTATION_MAX_ATTEMPTS)
    }

    pub fn never() -> Self {
        Self::new(1)
    }

    pub fn with_predicate<F>(mut self, is_retryable: F) -> Self
    where
        F: Fn(&NormalizedError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(is_retryable);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Spread each delay uniformly over `[delay / 2, delay]`
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn is_retryable(&self, error: &NormalizedError) -> bool {
        (self.is_retryable)(error)
    }

    /// Delay before the retry that follows failure number `failure_index` (0-based):
    /// `min(base * 2^failure_index, max)`.
    pub fn delay(&self, failure_index: u32) -> Duration {
        let factor = 2u32.saturating_pow(failure_index);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            delay
        }
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the attempt
    /// cap is reached. Backoff sleeps are interrupted by `cancel`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<T, NormalizedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NormalizedError>>,
    {
        let max_attempts = self.max_attempts();
        let mut failures = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(NormalizedError::cancelled());
            }
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            failures += 1;
            if failures >= max_attempts || !self.is_retryable(&error) {
                return Err(error);
            }

            let backoff = self.delay(failures - 1);
            warn!(
                op = label,
                attempt = failures,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(NormalizedError::cancelled()),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::query_default()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}
