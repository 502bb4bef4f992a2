//! Retry policy: bounded attempts with a fixed backoff between them.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::{Classifier, CoordinatorError, ErrorKind, classify};

/// Retry policy shared by every cluster manager and store interaction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Sleep between two attempts.
    pub delta_backoff: Duration,

    classifier: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delta_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delta_backoff,
            classifier: classify,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn should_retry(&self, err: &CoordinatorError) -> bool {
        (self.classifier)(err) == ErrorKind::Transient
    }

    /// Delay before the attempt following `attempts` failed ones.
    pub fn next_delay(&self, _attempts: u32) -> Duration {
        self.delta_backoff
    }

    /// Run `operation` synchronously, sleeping the current thread between attempts.
    ///
    /// The last error is returned once attempts are exhausted or a
    /// non-retryable error is seen.
    pub fn execute<T>(
        &self,
        name: &str,
        mut operation: impl FnMut() -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, elapsed = ?started.elapsed(), "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !self.should_retry(&err) {
                        warn!(operation = name, attempt, error = %err, "giving up");
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt);
                    info!(operation = name, attempt, ?delay, error = %err, "retrying");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Async variant of [`RetryPolicy::execute`]. Cancellation during a
    /// backoff sleep returns the error of the last attempt.
    pub async fn execute_async<T, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordinatorError>>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, elapsed = ?started.elapsed(), "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !self.should_retry(&err) {
                        warn!(operation = name, attempt, error = %err, "giving up");
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt);
                    info!(operation = name, attempt, ?delay, error = %err, "retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(err),
                    }
                    attempt += 1;
                }
            }
        }
    }
}
