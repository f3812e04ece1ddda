//! # Retry Policy
//!
//! Hard attempt ceiling with a fixed delay. Shared by retrying publishes and
//! retrying requests. No unbounded retry exists anywhere in the framework.

use std::time::Duration;

/// Bounded, fixed-delay retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// `max_attempts` counts the first try; it is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no retry.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Total attempts allowed.
    #[inline]
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    #[inline]
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `attempt` until it succeeds or the ceiling is reached.
    ///
    /// `on_failure` sees every failed attempt with its 1-based number and
    /// whether another attempt follows. The delay is only slept between
    /// attempts, never after the last one.
    pub(crate) fn run<T, E>(
        &self,
        mut attempt: impl FnMut(u32) -> Result<T, E>,
        mut on_failure: impl FnMut(u32, &E, bool),
    ) -> Result<(T, u32), (E, u32)> {
        let mut number = 1;
        loop {
            match attempt(number) {
                Ok(value) => return Ok((value, number)),
                Err(err) => {
                    let will_retry = number < self.max_attempts;
                    on_failure(number, &err, will_retry);
                    if !will_retry {
                        return Err((err, number));
                    }
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                    number += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}
