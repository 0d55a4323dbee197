//! Bounded retry for failure-prone network steps

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: usize,
    /// Delay before the second attempt; zero retries immediately
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// How a retried operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: usize },
    /// Every attempt failed with a retryable error
    Exhausted { error: E, attempts: usize },
    /// An attempt failed with an error that is not worth retrying
    Aborted { error: E, attempts: usize },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Retry executor
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails with an error `is_retryable`
    /// rejects, or `max_attempts` is reached. The closure receives the
    /// 1-based attempt number.
    #[instrument(skip(self, operation, is_retryable))]
    pub async fn execute<F, Fut, T, E, R>(&self, mut operation: F, is_retryable: R) -> RetryOutcome<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return RetryOutcome::Succeeded { value, attempts: attempt };
                }
                Err(error) => {
                    if !is_retryable(&error) {
                        error!("Attempt {} failed with a permanent error: {}", attempt, error);
                        return RetryOutcome::Aborted { error, attempts: attempt };
                    }
                    if attempt >= max_attempts {
                        error!("Giving up after {} attempts: {}", attempt, error);
                        return RetryOutcome::Exhausted { error, attempts: attempt };
                    }

                    warn!("Attempt {} failed: {}, retrying in {:?}", attempt, error, delay);

                    if !delay.is_zero() {
                        let actual_delay = if self.config.jitter {
                            let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
                            delay + Duration::from_millis(jitter_ms)
                        } else {
                            delay
                        };

                        tokio::time::sleep(actual_delay).await;

                        delay = Duration::from_millis(
                            (delay.as_millis() as f64 * self.config.backoff_multiplier) as u64,
                        )
                        .min(self.config.max_delay);
                    }
                }
            }
        }
    }
}
