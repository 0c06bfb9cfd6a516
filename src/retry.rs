//! Bounded retry with a fixed delay.
//!
//! A [`RetryPolicy`] runs an operation up to `max_attempts` times. After each
//! failure the classifier decides whether the error ends the loop at once
//! ([`RetryDecision::FailFast`]) or may be retried until the attempts run out
//! ([`RetryDecision::RetryableUntilExhausted`]). The last error is returned
//! unchanged.

use crate::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    FailFast,
    RetryableUntilExhausted,
}

/// Maps an error to a [`RetryDecision`]
pub type ErrorClassifier = Arc<dyn Fn(&Error) -> RetryDecision + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    delay: Duration,
    classifier: ErrorClassifier,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl RetryPolicy {
    /// Retry every error
    pub fn new(delay: Duration) -> Self {
        Self::with_classifier(delay, |_| RetryDecision::RetryableUntilExhausted)
    }

    pub fn with_classifier<C>(delay: Duration, classifier: C) -> Self
    where
        C: Fn(&Error) -> RetryDecision + Send + Sync + 'static,
    {
        Self {
            delay,
            classifier: Arc::new(classifier),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn classify(&self, error: &Error) -> RetryDecision {
        (self.classifier)(error)
    }

    /// Blocking variant. Sleeps the current thread between attempts.
    pub fn retry<R, F>(&self, mut op: F, max_attempts: u32) -> Result<R>
    where
        F: FnMut() -> Result<R>,
    {
        check_attempts(max_attempts)?;

        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.should_retry(&e, attempt, max_attempts, "call") {
                        return Err(e);
                    }
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }

    pub async fn retry_async<R, F, Fut>(&self, op: F, max_attempts: u32) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.run("call", op, max_attempts).await
    }

    /// [`retry_async`](Self::retry_async) with an operation name for logs and metrics
    pub async fn run<R, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
        max_attempts: u32,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        check_attempts(max_attempts)?;

        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.should_retry(&e, attempt, max_attempts, operation) {
                        return Err(e);
                    }
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn should_retry(
        &self,
        error: &Error,
        attempt: u32,
        max_attempts: u32,
        operation: &'static str,
    ) -> bool {
        match self.classify(error) {
            RetryDecision::FailFast => false,
            RetryDecision::RetryableUntilExhausted if attempt >= max_attempts => false,
            RetryDecision::RetryableUntilExhausted => {
                debug!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %error,
                    "Retrying after failure"
                );
                crate::stats::record_retry(operation);
                true
            }
        }
    }
}

fn check_attempts(max_attempts: u32) -> Result<()> {
    if max_attempts < 1 {
        return Err(Error::Configuration(format!(
            "max_attempts must be greater than 0, got {}",
            max_attempts
        )));
    }
    Ok(())
}
