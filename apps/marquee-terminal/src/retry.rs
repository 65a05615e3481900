//! Bounded retry with exponential backoff, plus a consecutive-failure
//! circuit breaker for fronting network calls.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// The sleep schedule between attempts: the initial delay, multiplied by
    /// the backoff factor per step and capped at `max_delay`. One entry per
    /// possible retry.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut schedule = Vec::new();
        let mut delay = self.initial_delay;
        for _ in 1..self.max_attempts {
            schedule.push(delay);
            delay = (delay * self.backoff_factor).min(self.max_delay);
        }
        schedule
    }

    /// Run `op` until it succeeds, the attempts are exhausted, or
    /// `should_retry` rejects the error.
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, should_retry: P, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts {
                        warn!(%label, attempt, error = %err, "giving up after final attempt");
                        return Err(err);
                    }
                    if !should_retry(&err) {
                        debug!(%label, error = %err, "error is not retryable");
                        return Err(err);
                    }
                    warn!(
                        %label,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * self.backoff_factor).min(self.max_delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after a run of consecutive failures and lets a single probe call
/// through once the cooldown elapses (half-open); a success closes it again.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown)
                {
                    // half-open probe; a failure re-arms the cooldown
                    inner.opened_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold
            && inner.state == BreakerState::Closed
        {
            warn!(
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2,
        }
    }

    #[test]
    fn schedule_doubles_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 8,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            backoff_factor: 2,
        };
        let millis: Vec<u64> = policy
            .backoff_schedule()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(millis, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<&str, String> = fast_policy(3)
            .run("op", |_| true, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection reset".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), String> = fast_policy(3)
            .run("op", |_| false, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("bad payload".to_string())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), String> = fast_policy(3)
            .run("op", |_| true, move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(format!("timeout {}", n))
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), "timeout 2");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());

        tokio::time::sleep(Duration::from_millis(15)).await;
        // half-open probe
        assert!(breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
    }
}
