use std::time::{Duration, Instant};

use rand::Rng;

use crate::{breaker::CircuitBreaker, error::MandiResult};

/// Exponential-backoff retry wrapping any unit of work.
///
/// Whether an error is retried is decided purely by
/// [`MandiError::is_retryable`](crate::error::MandiError::is_retryable):
/// network faults and 5xx retry, schema drift / validation / 4xx fail
/// immediately. A breaker-open error propagates without consuming
/// attempts; the breaker is consulted inside the loop, before each
/// attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Cap on total elapsed time including sleeps.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            deadline: Duration::from_secs(10 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run `op` until it succeeds, a fatal error occurs, attempts are
    /// exhausted, or the deadline would be exceeded by the next sleep.
    #[tracing::instrument(skip_all, fields(op = op_name))]
    pub async fn run<T, F, Fut>(
        &self,
        op_name: &str,
        breaker: Option<&CircuitBreaker>,
        mut op: F,
    ) -> MandiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MandiResult<T>>,
    {
        let started = Instant::now();
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Some(b) = breaker {
                b.guard()?;
            }

            match op().await {
                Ok(value) => {
                    if let Some(b) = breaker {
                        b.on_success();
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if let Some(b) = breaker {
                        b.on_failure();
                    }
                    if !e.is_retryable() || attempt >= self.max_attempts {
                        tracing::error!(
                            attempt,
                            retryable = e.is_retryable(),
                            error = %e,
                            "retry_exhausted"
                        );
                        return Err(e);
                    }

                    let sleep = jittered(backoff);
                    if started.elapsed() + sleep > self.deadline {
                        tracing::error!(attempt, error = %e, "retry_deadline_exceeded");
                        return Err(e);
                    }

                    tracing::warn!(
                        attempt,
                        backoff_ms = sleep.as_millis() as u64,
                        error = %e,
                        "retrying_after_failure"
                    );
                    tokio::time::sleep(sleep).await;
                    backoff = Duration::min(backoff.mul_f64(self.multiplier), self.max_backoff);
                }
            }
        }
    }
}

/// ±20% jitter so herds of retries do not synchronize.
fn jittered(backoff: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..1.2);
    backoff.mul_f64(factor)
}
