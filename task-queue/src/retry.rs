//! Retry with deterministic backoff.
//!
//! The runner re-invokes an operation after each failure until it either
//! succeeds or the number of failures exceeds `max_retries`:
//!
//! - Attempt 1: immediate
//! - Attempt 2: after `policy.delay_for(1)`
//! - Attempt 3: after `policy.delay_for(2)`
//! - etc.
//!
//! There is no jitter, so the full schedule is known up front.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, TokioClock};

/// How long to wait before the next attempt.
#[derive(Clone)]
pub enum IntervalPolicy {
    /// Same delay after every failure.
    Fixed(Duration),
    /// Delay computed from the 1-based number of failures so far.
    Computed(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl IntervalPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed(delay)
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// `base * 2^(failures - 1)`: base, 2*base, 4*base, ...
    pub fn exponential(base: Duration) -> Self {
        Self::computed(move |failures| {
            let exponent = failures.saturating_sub(1).min(31);
            base.saturating_mul(1u32 << exponent)
        })
    }

    /// Delay to wait after the `failures`-th failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Computed(f) => f(failures),
        }
    }
}

impl fmt::Debug for IntervalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Executes fallible async operations with retries.
///
/// The runner holds no shared state besides its clock, so dropping a `run`
/// future part-way through simply abandons the remaining attempts.
#[derive(Clone)]
pub struct RetryRunner {
    clock: Arc<dyn Clock>,
}

impl RetryRunner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run `operation` until it succeeds or fails more than `max_retries` times.
    ///
    /// `operation` receives the 1-based attempt number. The error of the
    /// final attempt is returned when retries are exhausted.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        max_retries: u32,
        policy: &IntervalPolicy,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut failures: u32 = 0;

        loop {
            let attempt = failures + 1;
            match operation(attempt).await {
                Ok(value) => {
                    if failures > 0 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    failures += 1;
                    if failures > max_retries {
                        warn!(
                            "Operation failed after {} attempts, giving up: {}",
                            attempt, e
                        );
                        return Err(e);
                    }

                    let delay = policy.delay_for(failures);
                    debug!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt,
                        max_retries + 1,
                        e,
                        delay
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryRunner {
    fn default() -> Self {
        Self::new(Arc::new(TokioClock))
    }
}

impl fmt::Debug for RetryRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRunner").finish_non_exhaustive()
    }
}
