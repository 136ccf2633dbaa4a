//! Capped exponential backoff with jitter.
//!
//! The loop itself is generic over the attempted operation so command
//! execution and provider calls share one retry timeline and one event
//! vocabulary.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use toolflow_commons::ErrorCategory;
use toolflow_exec_events::{
    AttemptFailedEvent, AttemptStartedEvent, AttemptSucceededEvent, AttemptWaitingEvent,
    AttemptsTerminalEvent, EventEmitter, ExecEvent,
};

pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 10;
pub const MAX_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const MAX_MULTIPLIER: f64 = 10.0;
pub const DEFAULT_JITTER: f64 = 0.1;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryConfigError {
    #[error("max attempts must be between 1 and 10, got {0}")]
    MaxAttempts(u32),
    #[error("initial delay must not exceed 60000ms, got {0}ms")]
    InitialDelay(u128),
    #[error("backoff multiplier must be within [1, 10], got {0}")]
    Multiplier(f64),
    #[error("jitter must be within [0, 1), got {0}")]
    Jitter(f64),
    #[error("max delay {max_ms}ms is below the initial delay {initial_ms}ms")]
    MaxDelayBelowInitial { max_ms: u128, initial_ms: u128 },
}

/// Retry policy for a single operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Fractional spread applied symmetrically around the base delay.
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryConfig {
    /// Exactly one attempt, no waiting.
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with the given attempt budget and first delay; the cap is
    /// raised to the first delay when that exceeds the default cap.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: DEFAULT_MAX_DELAY.max(initial_delay),
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(RetryConfigError::MaxAttempts(self.max_attempts));
        }
        if self.initial_delay > MAX_INITIAL_DELAY {
            return Err(RetryConfigError::InitialDelay(self.initial_delay.as_millis()));
        }
        if !(1.0..=MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(RetryConfigError::Multiplier(self.multiplier));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(RetryConfigError::Jitter(self.jitter));
        }
        if self.max_delay < self.initial_delay {
            return Err(RetryConfigError::MaxDelayBelowInitial {
                max_ms: self.max_delay.as_millis(),
                initial_ms: self.initial_delay.as_millis(),
            });
        }
        Ok(())
    }

    /// Delay before the attempt following `attempt` (1-based) for a jitter
    /// sample `spread` in `[-1, 1]`. Never exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32, spread: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let cap_ms = self.max_delay.as_secs_f64() * 1000.0;
        let base_ms = (self.initial_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent))
            .min(cap_ms);
        let jittered_ms = base_ms * (1.0 + self.jitter * spread.clamp(-1.0, 1.0));
        Duration::from_secs_f64(jittered_ms.clamp(0.0, cap_ms) / 1000.0)
    }

    /// Delay with a fresh jitter sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let spread = rand::random::<f64>() * 2.0 - 1.0;
        self.delay_for(attempt, spread)
    }

    /// Upper bound on total time spent waiting between attempts.
    pub fn max_total_wait(&self) -> Duration {
        self.max_delay * self.max_attempts.saturating_sub(1)
    }
}

/// One failed attempt as reported by the attempted operation.
#[derive(Debug)]
pub struct AttemptFailure<E> {
    pub error: E,
    pub category: ErrorCategory,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl<E> AttemptFailure<E> {
    pub fn new(error: E, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            error,
            category,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Successful value plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Error from the last attempt.
    pub error: E,
    pub category: ErrorCategory,
    pub attempts: u32,
    /// `true` when the budget ran out; `false` when a non-retryable
    /// category stopped the loop early.
    pub exhausted: bool,
}

/// Runs `attempt_fn` until it succeeds, fails with a non-retryable
/// category, or the attempt budget is spent. `attempt_fn` receives the
/// 1-based attempt number.
pub async fn run_with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    emitter: &mut (dyn EventEmitter + Send),
    mut attempt_fn: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut + Send,
    Fut: Future<Output = Result<T, AttemptFailure<E>>> + Send,
    T: Send,
    E: Send,
{
    let max_attempts = config.max_attempts.max(MIN_ATTEMPTS);
    let started = Instant::now();
    let mut attempt = 1;

    loop {
        emitter.emit(&ExecEvent::AttemptStarted(AttemptStartedEvent {
            operation: operation.to_string(),
            attempt,
            max_attempts,
        }));
        let attempt_started = Instant::now();

        let failure = match attempt_fn(attempt).await {
            Ok(value) => {
                emitter.emit(&ExecEvent::AttemptSucceeded(AttemptSucceededEvent {
                    operation: operation.to_string(),
                    attempt_count: attempt,
                    elapsed_ms: elapsed_ms(started),
                }));
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(failure) => failure,
        };

        tracing::debug!(
            operation,
            attempt,
            category = %failure.category,
            message = %failure.message,
            "attempt failed"
        );
        emitter.emit(&ExecEvent::AttemptFailed(AttemptFailedEvent {
            operation: operation.to_string(),
            attempt,
            category: failure.category,
            exit_code: failure.exit_code,
            message: failure.message.clone(),
            elapsed_ms: elapsed_ms(attempt_started),
        }));

        let retryable = failure.category.is_retryable();
        if !retryable || attempt >= max_attempts {
            let terminal = AttemptsTerminalEvent {
                operation: operation.to_string(),
                attempt_count: attempt,
                category: failure.category,
            };
            emitter.emit(&if retryable {
                ExecEvent::AttemptsExhausted(terminal)
            } else {
                ExecEvent::AttemptsAborted(terminal)
            });
            return Err(RetryError {
                error: failure.error,
                category: failure.category,
                attempts: attempt,
                exhausted: retryable,
            });
        }

        let delay = config.next_delay(attempt);
        emitter.emit(&ExecEvent::AttemptWaiting(AttemptWaitingEvent {
            operation: operation.to_string(),
            next_attempt: attempt + 1,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }));
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use toolflow_exec_events::MemoryEmitter;

    #[test]
    fn validation_bounds() {
        assert!(RetryConfig::default().validate().is_ok());
        assert_eq!(
            RetryConfig::new(0, Duration::ZERO).validate(),
            Err(RetryConfigError::MaxAttempts(0))
        );
        assert_eq!(
            RetryConfig::new(11, Duration::ZERO).validate(),
            Err(RetryConfigError::MaxAttempts(11))
        );
        assert_eq!(
            RetryConfig::new(3, Duration::from_millis(60_001)).validate(),
            Err(RetryConfigError::InitialDelay(60_001))
        );
        assert!(RetryConfig::new(3, Duration::from_millis(60_000)).validate().is_ok());
        assert!(
            RetryConfig::default()
                .with_multiplier(0.5)
                .validate()
                .is_err()
        );
        assert!(RetryConfig::default().with_jitter(1.0).validate().is_err());
        assert!(
            RetryConfig::new(3, Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn delays_grow_geometrically_and_respect_cap() {
        let config = RetryConfig::new(5, Duration::from_millis(100))
            .with_jitter(0.0)
            .with_max_delay(Duration::from_millis(350));
        let delays: Vec<u128> = (1..=4)
            .map(|attempt| config.delay_for(attempt, 0.0).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[test]
    fn jitter_never_pushes_past_cap() {
        let config = RetryConfig::new(10, Duration::from_secs(1))
            .with_jitter(0.5)
            .with_max_delay(Duration::from_secs(2));
        assert_eq!(config.delay_for(1, 1.0), Duration::from_millis(1500));
        assert_eq!(config.delay_for(1, -1.0), Duration::from_millis(500));
        assert_eq!(config.delay_for(6, 1.0), Duration::from_secs(2));
        for attempt in 1..=9 {
            assert!(config.next_delay(attempt) <= config.max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_reports_attempts() {
        let config = RetryConfig::new(3, Duration::from_millis(10));
        let mut events = MemoryEmitter::new();
        let result = run_with_retry(&config, "probe", &mut events, |attempt| async move {
            if attempt < 3 {
                Err(AttemptFailure::new((), ErrorCategory::Network, "connection reset"))
            } else {
                Ok("ok")
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Retried { value: "ok", attempts: 3 });
        let kinds: Vec<String> = events
            .events()
            .iter()
            .map(|event| toolflow_exec_events::json::to_value(event).unwrap()["type"].to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "\"attempt.started\"",
                "\"attempt.failed\"",
                "\"attempt.waiting\"",
                "\"attempt.started\"",
                "\"attempt.failed\"",
                "\"attempt.waiting\"",
                "\"attempt.started\"",
                "\"attempt.succeeded\"",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_category_stops_after_one_attempt() {
        let config = RetryConfig::new(5, Duration::from_millis(10));
        let mut calls = 0;
        let mut events = MemoryEmitter::new();
        let err = run_with_retry(&config, "probe", &mut events, |_| {
            calls += 1;
            async { Err::<(), _>(AttemptFailure::new("denied", ErrorCategory::Authentication, "401")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.attempts, 1);
        assert!(!err.exhausted);
        assert_eq!(err.error, "denied");
        assert!(matches!(events.events().last(), Some(ExecEvent::AttemptsAborted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn total_wait_stays_within_bound() {
        let config = RetryConfig::new(4, Duration::from_millis(500))
            .with_jitter(0.9)
            .with_max_delay(Duration::from_millis(800));
        let mut events = MemoryEmitter::new();
        let started = Instant::now();
        let err = run_with_retry(&config, "probe", &mut events, |_| async {
            Err::<(), _>(AttemptFailure::new((), ErrorCategory::Timeout, "timed out"))
        })
        .await
        .unwrap_err();

        assert!(err.exhausted);
        assert_eq!(err.attempts, 4);
        assert!(started.elapsed() <= config.max_total_wait());
        let waited: u64 = events
            .events()
            .iter()
            .filter_map(|event| match event {
                ExecEvent::AttemptWaiting(waiting) => Some(waiting.delay_ms),
                _ => None,
            })
            .sum();
        assert!(u128::from(waited) <= config.max_total_wait().as_millis());
    }
}
