//! Bounded retry with backoff.
//!
//! Two flavours are in use:
//! - [`RetryPolicy::random_exponential`] for broker connection errors, full-jitter exponential
//!   backoff (`uniform(0, min(max, multiplier × 2^n))`).
//! - [`RetryPolicy::fixed`] for a full readings queue, a constant wait.
//!
//! Only errors that report themselves as [`Transient`] are retried, anything else is handed back
//! straight away as [`RetryError::Permanent`]. The [`StopCondition`] is evaluated after every
//! transient failure and again after every backoff sleep; once met the call ends in
//! [`RetryError::Exhausted`].

use std::{fmt::Display, future::Future, time::Duration};

use backoff::backoff::{Backoff, Constant};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::shutdown::StopCondition;

pub const RANDOM_EXPONENTIAL_MULTIPLIER: Duration = Duration::from_millis(500);
pub const RANDOM_EXPONENTIAL_MAX: Duration = Duration::from_secs(30);
pub const FIXED_WAIT: Duration = Duration::from_millis(500);

pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry stopped after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error(transparent)]
    Permanent(E),
}

/// Full-jitter exponential backoff.
#[derive(Debug)]
pub struct FullJitter {
    multiplier: Duration,
    max: Duration,
    attempt: u32,
}

impl FullJitter {
    pub fn new(multiplier: Duration, max: Duration) -> Self {
        Self {
            multiplier,
            max,
            attempt: 0,
        }
    }

    fn ceiling(&self) -> Duration {
        let exp = 2f64.powi(self.attempt.min(i32::MAX as u32) as i32);
        let secs = self.multiplier.as_secs_f64() * exp;
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Backoff for FullJitter {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let secs = rand::thread_rng().gen_range(0.0..=ceiling.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Strategy {
    RandomExponential { multiplier: Duration, max: Duration },
    Fixed { wait: Duration },
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: Strategy,
    /// Logged after every failed attempt.
    warning: String,
}

impl RetryPolicy {
    pub fn random_exponential(
        multiplier: Duration,
        max: Duration,
        warning: impl Into<String>,
    ) -> Self {
        Self {
            strategy: Strategy::RandomExponential { multiplier, max },
            warning: warning.into(),
        }
    }

    pub fn fixed(wait: Duration, warning: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::Fixed { wait },
            warning: warning.into(),
        }
    }

    /// The broker reconnect policy: 0.5s multiplier, 30s cap.
    pub fn broker(uri_hint: &str) -> Self {
        Self::random_exponential(
            RANDOM_EXPONENTIAL_MULTIPLIER,
            RANDOM_EXPONENTIAL_MAX,
            format!("unable to reach broker at {uri_hint}"),
        )
    }

    /// The readings queue policy: wait 0.5s between attempts.
    pub fn queue_full() -> Self {
        Self::fixed(FIXED_WAIT, "readings queue is full")
    }

    fn backoff(&self) -> Box<dyn Backoff + Send> {
        match self.strategy {
            Strategy::RandomExponential { multiplier, max } => {
                Box::new(FullJitter::new(multiplier, max))
            }
            Strategy::Fixed { wait } => Box::new(Constant::new(wait)),
        }
    }

    pub async fn execute<T, E, F, Fut>(
        &self,
        mut operation: F,
        stop: &StopCondition,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut state = RetryState::new(self.backoff());

        loop {
            state.attempts += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(RetryError::Permanent(err));
            }

            warn!(attempt = state.attempts, error = %err, "{}", self.warning);

            if state.check_stop(stop) {
                return Err(state.exhausted(err));
            }

            let delay = match state.next_delay() {
                Some(delay) => delay,
                None => return Err(state.exhausted(err)),
            };
            debug!(
                attempt = state.attempts,
                delay_ms = delay.as_millis() as u64,
                "backing off before retrying"
            );

            stop.sleep(delay).await;
            if state.check_stop(stop) {
                return Err(state.exhausted(err));
            }
        }
    }
}

/// Per-call bookkeeping. `stopped` never flips back once set.
struct RetryState {
    attempts: u32,
    backoff: Box<dyn Backoff + Send>,
    last_delay: Option<Duration>,
    stopped: bool,
}

impl RetryState {
    fn new(backoff: Box<dyn Backoff + Send>) -> Self {
        Self {
            attempts: 0,
            backoff,
            last_delay: None,
            stopped: false,
        }
    }

    fn check_stop(&mut self, stop: &StopCondition) -> bool {
        self.stopped = self.stopped || stop.is_met();
        self.stopped
    }

    fn next_delay(&mut self) -> Option<Duration> {
        self.last_delay = self.backoff.next_backoff();
        self.last_delay
    }

    fn exhausted<E>(&self, last: E) -> RetryError<E> {
        debug!(
            attempts = self.attempts,
            last_delay_ms = self.last_delay.map(|delay| delay.as_millis() as u64),
            "giving up retrying"
        );
        RetryError::Exhausted {
            attempts: self.attempts,
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            *self == TestError::Flaky
        }
    }

    fn cancelled() -> StopCondition {
        let token = CancellationToken::new();
        token.cancel();
        StopCondition::on_cancel(token)
    }

    #[tokio::test]
    async fn exhausts_on_first_attempt_when_already_stopped() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::broker("test")
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Flaky)
                },
                &cancelled(),
            )
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last, TestError::Flaky);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::queue_full()
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Broken)
                },
                &StopCondition::never(),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(TestError::Broken))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::queue_full()
            .execute(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(42)
                    }
                },
                &StopCondition::never(),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let token = CancellationToken::new();
        let stop = StopCondition::on_cancel(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            token.cancel();
        });

        let result: Result<(), _> = RetryPolicy::queue_full()
            .execute(|| async { Err(TestError::Flaky) }, &stop)
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert!(attempts >= 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        canceller.await.unwrap();
    }

    #[test]
    fn full_jitter_stays_under_ceiling() {
        let mut backoff = FullJitter::new(RANDOM_EXPONENTIAL_MULTIPLIER, RANDOM_EXPONENTIAL_MAX);
        for attempt in 0..20 {
            let ceiling = (0.5 * 2f64.powi(attempt)).min(30.0);
            let delay = backoff.next_backoff().unwrap();
            assert!(
                delay.as_secs_f64() <= ceiling,
                "attempt {attempt}: {delay:?} above {ceiling}s"
            );
        }
    }

    #[test]
    fn full_jitter_reset_starts_over() {
        let mut backoff = FullJitter::new(RANDOM_EXPONENTIAL_MULTIPLIER, RANDOM_EXPONENTIAL_MAX);
        for _ in 0..10 {
            backoff.next_backoff();
        }
        backoff.reset();
        assert_eq!(backoff.ceiling(), RANDOM_EXPONENTIAL_MULTIPLIER);
    }
}
