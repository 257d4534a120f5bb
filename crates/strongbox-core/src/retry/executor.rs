//! Retry execution engine

use std::error::Error;
use std::future::Future;
use std::time::Instant;

use crate::abort::AbortSignal;
use crate::types::RetryPolicy;

use super::error::RetryError;
use super::observer::{NoOpObserver, RetryObserver};
use super::strategies::{calculate_delay, AlwaysRetry, RetryPredicate};

/// Builder for configuring a `RetryExecutor`
///
/// # Example
///
/// ```rust
/// use strongbox_core::retry::{RetryExecutorBuilder, TracingObserver, TransientOnly};
/// use strongbox_core::types::RetryPolicy;
/// use strongbox_core::AbortSignal;
///
/// let executor = RetryExecutorBuilder::new()
///     .with_policy(RetryPolicy::default())
///     .with_predicate(TransientOnly)
///     .with_observer(TracingObserver::new("upload part 1"))
///     .with_abort(AbortSignal::new())
///     .build();
/// ```
pub struct RetryExecutorBuilder<P = AlwaysRetry, O = NoOpObserver> {
    policy: RetryPolicy,
    predicate: P,
    observer: O,
    abort: Option<AbortSignal>,
}

impl Default for RetryExecutorBuilder<AlwaysRetry, NoOpObserver> {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutorBuilder<AlwaysRetry, NoOpObserver> {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
            predicate: AlwaysRetry,
            observer: NoOpObserver,
            abort: None,
        }
    }
}

impl<P, O> RetryExecutorBuilder<P, O> {
    /// Set the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the retry predicate
    pub fn with_predicate<P2>(self, predicate: P2) -> RetryExecutorBuilder<P2, O> {
        RetryExecutorBuilder {
            policy: self.policy,
            predicate,
            observer: self.observer,
            abort: self.abort,
        }
    }

    /// Set the observer
    pub fn with_observer<O2>(self, observer: O2) -> RetryExecutorBuilder<P, O2> {
        RetryExecutorBuilder {
            policy: self.policy,
            predicate: self.predicate,
            observer,
            abort: self.abort,
        }
    }

    /// Stop retrying once `abort` fires
    ///
    /// The signal interrupts both a running attempt and the backoff sleep.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Build the executor
    pub fn build(self) -> RetryExecutor<P, O> {
        RetryExecutor {
            policy: self.policy,
            predicate: self.predicate,
            observer: self.observer,
            abort: self.abort,
        }
    }
}

/// A retry executor with configurable policy, predicate, observer and abort signal
///
/// Use `RetryExecutorBuilder` to create an instance.
pub struct RetryExecutor<P, O> {
    policy: RetryPolicy,
    predicate: P,
    observer: O,
    abort: Option<AbortSignal>,
}

impl<P, O> RetryExecutor<P, O>
where
    O: RetryObserver,
{
    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + Send + 'static,
        P: RetryPredicate<E>,
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<E> = None;

        for attempt in 1..=max_attempts {
            if self.is_aborted() {
                return Err(self.cancel(attempt - 1, last_error));
            }

            self.observer.on_attempt_start(attempt, max_attempts);

            let outcome = match &self.abort {
                Some(abort) => tokio::select! {
                    outcome = op() => outcome,
                    _ = abort.cancelled() => return Err(self.cancel(attempt, last_error)),
                },
                None => op().await,
            };

            let err = match outcome {
                Ok(result) => {
                    self.observer.on_success(attempt, start.elapsed());
                    return Ok(result);
                }
                Err(err) => err,
            };

            if !self.predicate.should_retry(&err) {
                self.observer.on_cancelled(attempt, Some(&err));
                return Err(RetryError::non_retryable(err));
            }

            if attempt >= max_attempts {
                self.observer.on_exhausted(attempt, &err);
                return Err(RetryError::exhausted(attempt, err, start.elapsed()));
            }

            let delay = calculate_delay(&self.policy, attempt, true);
            self.observer.on_attempt_failed(attempt, &err, delay);
            last_error = Some(err);

            if delay.is_zero() {
                continue;
            }
            match &self.abort {
                Some(abort) => tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = abort.cancelled() => return Err(self.cancel(attempt, last_error)),
                },
                None => tokio::time::sleep(delay).await,
            }
        }

        Err(self.cancel(max_attempts, last_error))
    }

    fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    fn cancel<E: Error + 'static>(&self, attempts: u32, last_error: Option<E>) -> RetryError<E> {
        self.observer
            .on_cancelled(attempts, last_error.as_ref().map(|e| e as &dyn Error));
        RetryError::cancelled(attempts, last_error)
    }
}
