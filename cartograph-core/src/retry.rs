use crate::errors::{classify, CartographError};
use crate::prelude::*;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter. `unit` is a uniform sample in [0, 1).
    /// Exposed for deterministic testing; `delay` draws the sample itself.
    pub fn delay_with_unit(&self, attempt: u32, unit: f64) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(20));
        let capped = exp.min(self.max_delay);
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * unit;
        capped.mul_f64(factor.max(0.0)).min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen::<f64>();
        self.delay_with_unit(attempt, unit)
    }
}

type RetryPredicate<'a> = Box<dyn Fn(&CartographError) -> bool + Send + Sync + 'a>;
type RetryObserver<'a> = Box<dyn Fn(u32, &CartographError, Duration) + Send + Sync + 'a>;

/// Options for [`retry`]. The default predicate consults the error
/// classifier; a custom one can widen or narrow what is considered
/// transient.
#[derive(Default)]
pub struct RetryOptions<'a> {
    pub policy: RetryPolicy,
    pub cancel: Option<&'a CancellationToken>,
    pub should_retry: Option<RetryPredicate<'a>>,
    pub on_retry: Option<RetryObserver<'a>>,
}

impl<'a> RetryOptions<'a> {
    pub fn with_policy(policy: RetryPolicy) -> Self {
        RetryOptions {
            policy,
            ..Default::default()
        }
    }

    pub fn cancelled_by(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Runs `op` until it succeeds, fails terminally, exhausts
/// `policy.max_attempts` or the cancellation token fires. Delays grow as
/// `base * 2^(attempt-1)` capped at `max_delay`, jittered; a provider-sent
/// retry-after hint takes precedence when it is longer.
pub async fn retry<'a, T, F, Fut>(options: RetryOptions<'a>, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = options.policy.max_attempts.max(1);
    let mut last_err: Option<CartographError> = None;

    for attempt in 1..=attempts {
        if let Some(token) = options.cancel {
            if token.is_cancelled() {
                return Err(CartographError::cancelled());
            }
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                let transient = match &options.should_retry {
                    Some(predicate) => predicate(&err),
                    None => class.retryable,
                };
                if !transient || attempt == attempts {
                    return Err(err);
                }

                let mut delay = options.policy.delay(attempt);
                if let Some(hint_ms) = class.retry_after_ms {
                    delay = delay.max(Duration::from_millis(hint_ms));
                }
                debug!(
                    "retrying after {delay:?} (attempt {attempt}/{attempts}, category {})",
                    class.category
                );
                if let Some(observer) = &options.on_retry {
                    observer(attempt, &err, delay);
                }
                last_err = Some(err);

                match options.cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(CartographError::cancelled()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(CartographError::cancelled))
}
