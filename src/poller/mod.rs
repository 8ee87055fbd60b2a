//! Bounded polling shared by every wait in the rollout pipeline.
//!
//! A [`Poller`] owns the only two knobs a wait has: the ceiling and the
//! cadence. Predicates report whether the awaited condition holds and classify
//! their own failures: transient failures are logged and retried on the next
//! tick, fatal failures propagate immediately. Timing out is an outcome, not an
//! error, so callers decide how to describe it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Failure reported by a poll predicate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollFailure<E> {
    /// The condition could not be checked this time; try again next tick.
    Transient(E),
    /// The condition can never be satisfied; stop polling.
    Fatal(E),
}

/// Result of a completed wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollOutcome {
    /// The predicate returned `true`.
    Satisfied {
        /// Number of predicate invocations, including the successful one.
        attempts: u32,
    },
    /// The ceiling elapsed before the predicate returned `true`.
    TimedOut {
        /// Wall-clock time spent waiting.
        elapsed: Duration,
        /// Configured ceiling.
        ceiling: Duration,
        /// Number of predicate invocations.
        attempts: u32,
    },
}

impl PollOutcome {
    /// Returns `true` when the awaited condition was observed.
    #[must_use]
    pub const fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }
}

/// Retry-until-condition primitive with an optional wall-clock ceiling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Poller {
    max_wait: Option<Duration>,
    retry_delay: Duration,
}

impl Poller {
    /// Builds a poller that gives up once `max_wait` has elapsed.
    #[must_use]
    pub const fn bounded(max_wait: Duration, retry_delay: Duration) -> Self {
        Self {
            max_wait: Some(max_wait),
            retry_delay,
        }
    }

    /// Builds a poller that waits for as long as it takes.
    #[must_use]
    pub const fn unbounded(retry_delay: Duration) -> Self {
        Self {
            max_wait: None,
            retry_delay,
        }
    }

    /// Returns the ceiling, if any.
    #[must_use]
    pub const fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Invokes `predicate` until it returns `true` or the ceiling elapses.
    ///
    /// The predicate always runs at least once. After each unsuccessful
    /// attempt the poller checks the ceiling and otherwise sleeps for the
    /// retry delay, so a timed-out wait reports an elapsed time between the
    /// ceiling and the ceiling plus one delay (plus predicate run time).
    ///
    /// # Errors
    ///
    /// Returns the predicate's error when it reports
    /// [`PollFailure::Fatal`].
    pub async fn wait_until<F, Fut, E>(&self, mut predicate: F) -> Result<PollOutcome, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, PollFailure<E>>>,
        E: Display,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            match predicate().await {
                Ok(true) => return Ok(PollOutcome::Satisfied { attempts }),
                Ok(false) => debug!(attempts, "condition not met yet"),
                Err(PollFailure::Transient(err)) => {
                    warn!(attempts, error = %err, "transient failure while polling; retrying");
                }
                Err(PollFailure::Fatal(err)) => return Err(err),
            }

            if let Some(ceiling) = self.max_wait {
                let elapsed = started.elapsed();
                if elapsed >= ceiling {
                    warn!(
                        elapsed_secs = elapsed.as_secs(),
                        ceiling_secs = ceiling.as_secs(),
                        "maximum wait time reached"
                    );
                    return Ok(PollOutcome::TimedOut {
                        elapsed,
                        ceiling,
                        attempts,
                    });
                }
            }

            sleep(self.retry_delay).await;
        }
    }
}
