//! Bounded polling for a recovery predicate.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tunnelcheck_common::error::TimeoutError;

const MIN_POLL: Duration = Duration::from_millis(1);

/// Time source for polling. Tests substitute [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when slept on or advanced.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    pub succeeded: bool,
    /// Time from the first evaluation to the deciding one.
    pub elapsed: Duration,
    pub polls: u32,
}

impl Recovery {
    pub fn into_result(self, what: impl Into<String>) -> Result<Duration, TimeoutError> {
        if self.succeeded {
            Ok(self.elapsed)
        } else {
            Err(TimeoutError {
                what: what.into(),
                waited: self.elapsed,
            })
        }
    }
}

/// Evaluate `predicate` immediately and then every `poll` until it holds or
/// `timeout` has passed. The predicate is evaluated once more at the
/// deadline.
pub fn wait_until<F>(clock: &dyn Clock, mut predicate: F, timeout: Duration, poll: Duration) -> Recovery
where
    F: FnMut() -> bool,
{
    let poll = poll.max(MIN_POLL);
    let start = clock.now();
    let mut polls = 0;
    loop {
        polls += 1;
        let elapsed = clock.now().saturating_sub(start);
        if predicate() {
            tracing::debug!(?elapsed, polls, "recovery predicate satisfied");
            return Recovery {
                succeeded: true,
                elapsed,
                polls,
            };
        }
        if elapsed >= timeout {
            return Recovery {
                succeeded: false,
                elapsed,
                polls,
            };
        }
        clock.sleep(poll.min(timeout - elapsed));
    }
}
