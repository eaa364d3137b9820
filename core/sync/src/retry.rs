//! Exponential backoff.
//!
//! One curve serves two purposes: spacing automatic re-queues of failed
//! operations across passes, and re-issuing a single call inside a pass.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use tether_common::{Error, Result};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Immediate re-issues allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the grown delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default curve with `max_retries` immediate re-issues.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`, then
    /// jittered. Degenerate parameters fall back to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let grown = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = grown.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter {
            0.75 + rand::random::<f64>() * 0.5
        } else {
            1.0
        };

        Duration::try_from_secs_f64(capped * factor).unwrap_or(self.max_delay)
    }
}

/// Re-runs a fallible async call according to a [`RetryConfig`].
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

    /// Run a storage call, retrying I/O failures.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(call, |err: &Error| matches!(err, Error::Io(_)))
            .await
    }

    /// Run `call`, re-issuing it while `should_retry` accepts the error and
    /// the budget lasts.
    ///
    /// The call runs at most `max_retries + 1` times; the last error is
    /// returned as is.
    pub async fn execute_with_condition<F, Fut, T, E, C>(
        &self,
        call: F,
        should_retry: C,
    ) -> std::result::Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let mut retries = 0;

        loop {
            let err = match call().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Call succeeded on retry {}", retries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if retries >= self.config.max_retries || !should_retry(&err) {
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            warn!(
                "Retry {}/{} in {:?} after: {}",
                retries, self.config.max_retries, delay, err
            );
            sleep(delay).await;
        }
    }
}
