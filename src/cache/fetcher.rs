//! Source lookups with per-attempt timeout and exponential backoff.
//!
//! A concurrency slot is held for exactly one attempt. The backoff sleep
//! between attempts happens with no slot held, so a caller stuck retrying
//! never keeps other callers' first attempts waiting.

use crate::cache::limiter::ConcurrencyLimiter;
use crate::cache::redact::sanitize;
use crate::error::{ConfigError, FetchError};
use crate::metrics::SharedMetrics;
use crate::services::identity::{Identity, IdentitySource};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Hard ceiling on retries per lookup
pub const MAX_RETRIES_CEILING: u32 = 10;

/// Validated retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_retries > MAX_RETRIES_CEILING {
            return Err(ConfigError::RetryCeiling {
                value: max_retries,
                ceiling: MAX_RETRIES_CEILING,
            });
        }
        for (option, value) in [
            ("base_delay_seconds", base_delay),
            ("max_delay_seconds", max_delay),
            ("request_timeout_seconds", timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::NotPositive {
                    option,
                    value: "0".to_string(),
                });
            }
        }
        if base_delay > max_delay {
            return Err(ConfigError::DelayOrder {
                base: base_delay.as_secs_f64(),
                max: max_delay.as_secs_f64(),
            });
        }

        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            timeout,
        })
    }

    /// Same policy with a different retry count (still ceiling-checked).
    pub fn with_max_retries(&self, max_retries: u32) -> Result<Self, ConfigError> {
        Self::new(max_retries, self.base_delay, self.max_delay, self.timeout)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// `min(base * 2^attempt, max)`, saturating at `max` on overflow.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub identity: Identity,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Performs source lookups under the shared concurrency bound.
#[derive(Clone)]
pub struct RetryingFetcher {
    source: Arc<dyn IdentitySource>,
    limiter: ConcurrencyLimiter,
    metrics: SharedMetrics,
}

impl RetryingFetcher {
    pub fn new(
        source: Arc<dyn IdentitySource>,
        limiter: ConcurrencyLimiter,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            source,
            limiter,
            metrics,
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Look `username` up, retrying transient failures per `policy`.
    pub async fn fetch(&self, username: &str, policy: &RetryPolicy) -> Result<Fetched, FetchError> {
        let total_attempts = policy.max_retries() + 1;
        let mut last_error = String::new();

        for attempt in 0..total_attempts {
            if attempt > 0 {
                let delay = policy.backoff_delay(attempt - 1);
                warn!(
                    username = %username,
                    attempt = attempt + 1,
                    max_attempts = total_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Source lookup failed, retrying"
                );
                self.metrics.record_retry();
                sleep(delay).await;
            }

            let outcome = {
                let Some(permit) = self.limiter.acquire().await else {
                    debug!(username = %username, attempts = attempt, "Limiter closed, abandoning lookup");
                    return Err(FetchError::Cancelled);
                };
                self.metrics.set_in_flight(self.limiter.active_count());

                let outcome = timeout(policy.timeout(), self.source.lookup_user(username)).await;

                drop(permit);
                self.metrics.set_in_flight(self.limiter.active_count());
                outcome
            };

            match outcome {
                Ok(Ok(Some(identity))) => {
                    self.metrics.record_lookup_attempt("success");
                    debug!(username = %username, attempts = attempt + 1, "Source lookup succeeded");
                    return Ok(Fetched {
                        identity,
                        attempts: attempt + 1,
                    });
                }
                Ok(Ok(None)) => {
                    self.metrics.record_lookup_attempt("not_found");
                    debug!(username = %username, "Source system has no such user");
                    return Err(FetchError::NotFound {
                        username: username.to_string(),
                    });
                }
                Ok(Err(e)) if e.is_transient() => {
                    self.metrics.record_lookup_attempt("transient");
                    last_error = sanitize(&e.to_string());
                }
                Ok(Err(e)) => {
                    self.metrics.record_lookup_attempt("rejected");
                    let message = sanitize(&e.to_string());
                    warn!(
                        username = %username,
                        kind = e.kind(),
                        error = %message,
                        "Source lookup rejected, not retrying"
                    );
                    return Err(FetchError::Rejected { message });
                }
                Err(_elapsed) => {
                    self.metrics.record_lookup_attempt("timeout");
                    last_error = format!(
                        "attempt timed out after {}ms",
                        policy.timeout().as_millis()
                    );
                }
            }
        }

        warn!(
            username = %username,
            attempts = total_attempts,
            error = %last_error,
            "Source lookup retries exhausted"
        );
        Err(FetchError::Exhausted {
            attempts: total_attempts,
            last_error,
        })
    }
}
