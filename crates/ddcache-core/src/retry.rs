//! Fixed-interval retry for one transfer attempt at a time.
//!
//! The policy only counts attempts and sleeps. Whether a failure is worth
//! another attempt is decided by the unit of work itself, which returns an
//! [`AttemptError`] flagged either `retry` or `abort`.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::errors::find_transfer_error;

/// Failure of a single attempt, with the unit of work's verdict on retrying.
#[derive(Debug)]
pub struct AttemptError {
    pub error: eyre::Report,
    pub abort: bool,
}

impl AttemptError {
    /// The attempt failed but a fresh one may succeed.
    pub fn retry(error: impl Into<eyre::Report>) -> Self {
        Self {
            error: error.into(),
            abort: false,
        }
    }

    /// The attempt failed in a way no retry will fix; stop now.
    pub fn abort(error: impl Into<eyre::Report>) -> Self {
        Self {
            error: error.into(),
            abort: true,
        }
    }

    /// Aborts when the typed cause is fatal or not an error at all, retries otherwise.
    pub fn classify(error: eyre::Report) -> Self {
        let abort = find_transfer_error(&error).is_some_and(|err| err.should_abort());
        Self { error, abort }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    wait: Duration,
}

impl RetryPolicy {
    /// `attempts` is the total budget including the first try; zero is treated as one.
    pub fn new(attempts: u32, wait: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            wait,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `op` until it succeeds, asks to abort, or the budget is spent.
    /// `op` receives the 0-based attempt index. The last error is returned.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> eyre::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError { error, abort }) => {
                    attempt += 1;
                    if abort {
                        debug!("attempt {} requested abort: {error:#}", attempt);
                        return Err(error);
                    }
                    if attempt >= self.attempts {
                        debug!("giving up after {} attempts", attempt);
                        return Err(error);
                    }
                    warn!(
                        "attempt {}/{} failed: {error:#}; retrying in {:?}",
                        attempt, self.attempts, self.wait
                    );
                    tokio::time::sleep(self.wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransferError;
    use eyre::eyre;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_after_k_failures_within_budget() {
        let mut calls = 0u32;
        let mut seen = Vec::new();
        let result = quick(3)
            .run(|attempt| {
                calls += 1;
                seen.push(attempt);
                async move {
                    if attempt < 2 {
                        Err(AttemptError::retry(eyre!("flaky {attempt}")))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let mut calls = 0u32;
        let result: eyre::Result<()> = quick(3)
            .run(|attempt| {
                calls += 1;
                async move { Err(AttemptError::retry(eyre!("failure {attempt}"))) }
            })
            .await;
        assert_eq!(calls, 3);
        assert_eq!(result.unwrap_err().to_string(), "failure 2");
    }

    #[tokio::test]
    async fn abort_stops_after_one_attempt() {
        let mut calls = 0u32;
        let result: eyre::Result<()> = quick(10)
            .run(|_| {
                calls += 1;
                async { Err(AttemptError::abort(eyre!("malformed path"))) }
            })
            .await;
        assert_eq!(calls, 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn zero_budget_still_runs_once() {
        let mut calls = 0u32;
        let result = quick(0)
            .run(|_| {
                calls += 1;
                async { Ok::<_, AttemptError>(()) }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls, 1);
    }

    #[test]
    fn classify_follows_error_category() {
        let retry = AttemptError::classify(TransferError::transport("reset").into());
        assert!(!retry.abort);

        let abort = AttemptError::classify(TransferError::invalid_endpoint("bad url").into());
        assert!(abort.abort);

        let untyped = AttemptError::classify(eyre!("something else"));
        assert!(!untyped.abort);
    }
}
