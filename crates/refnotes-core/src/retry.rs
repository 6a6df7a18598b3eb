//! Exponential backoff with jitter, bounded by a deadline.
//!
//! Used by the sequence and by per-change primary storage migration to
//! retry compare-and-swap races.

use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::NotesError;

#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    jitter: Duration,
    deadline: Instant,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, jitter: Duration, timeout: Duration) -> Self {
        Self {
            next: initial,
            jitter,
            deadline: Instant::now() + timeout,
            attempts: 0,
        }
    }

    /// Sleeps taken so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Sleep before the next attempt. Returns `false` without sleeping once
    /// the deadline has passed.
    pub fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        let delay = (self.next + jitter).min(self.deadline - now);
        thread::sleep(delay);
        self.next = self.next.saturating_mul(2);
        self.attempts += 1;
        true
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// backoff deadline passes. The last error is returned on expiry.
///
/// # Errors
///
/// The first non-retryable error, or the last retryable one.
pub fn retry<T>(
    backoff: &mut Backoff,
    what: &str,
    mut op: impl FnMut() -> Result<T, NotesError>,
) -> Result<T, NotesError> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                if !backoff.wait() {
                    tracing::warn!(operation = what, attempts = backoff.attempts(), error = %err, "giving up after retries");
                    return Err(err);
                }
                tracing::debug!(operation = what, attempt = backoff.attempts(), error = %err, "retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(timeout_ms: u64) -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(1), Duration::from_millis(timeout_ms))
    }

    #[test]
    fn retries_until_success() {
        let mut calls = 0;
        let result = retry(&mut fast(5_000), "test", || {
            calls += 1;
            if calls < 3 {
                Err(NotesError::concurrency("refs/x", "lock"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.expect("eventually ok"), 3);
    }

    #[test]
    fn non_retryable_errors_stop_immediately() {
        let mut calls = 0;
        let result: Result<(), _> = retry(&mut fast(5_000), "test", || {
            calls += 1;
            Err(NotesError::WritesDisabled)
        });
        assert!(matches!(result, Err(NotesError::WritesDisabled)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn deadline_bounds_the_loop() {
        let start = Instant::now();
        let result: Result<(), _> = retry(&mut fast(30), "test", || {
            Err(NotesError::concurrency("refs/x", "lock"))
        });
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
