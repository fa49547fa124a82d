//! Bounded retry loop shared by lock-protected operations and seqlock reads
//!
//! Every attempt either completes or asks to be retried. Once the budget is
//! spent the caller gets `None` back and decides which error to surface.

use tracing::{trace, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Outcome of a single attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation finished
    Done(T),
    /// The operation must be repeated from the start
    Retry,
}

/// Retry budget applied around lock/unlock sequences and optimistic reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Yield the thread between attempts instead of spinning
    pub yield_between: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            yield_between: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry cap
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Total attempts this policy allows
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it returns [`Attempt::Done`] or the budget runs out.
    ///
    /// `op` receives the zero-based attempt number. Returns `None` when every
    /// attempt asked for a retry.
    pub fn run<T, F>(&self, what: &'static str, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Attempt<T>,
    {
        let attempts = self.max_attempts();
        for attempt in 0..attempts {
            match op(attempt) {
                Attempt::Done(value) => return Some(value),
                Attempt::Retry => {
                    trace!(op = what, attempt, "retrying");
                    if self.yield_between {
                        std::thread::yield_now();
                    } else {
                        core::hint::spin_loop();
                    }
                }
            }
        }
        warn!(op = what, attempts, "retry budget exhausted");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_succeeds() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let out = policy.run("test", |_| {
            calls += 1;
            Attempt::Done(7)
        });
        assert_eq!(out, Some(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_succeeds_after_retries() {
        let policy = RetryPolicy::with_max_retries(3);
        let out = policy.run("test", |attempt| {
            if attempt < 3 {
                Attempt::Retry
            } else {
                Attempt::Done(attempt)
            }
        });
        assert_eq!(out, Some(3));
    }

    #[test]
    fn test_exhaustion_is_bounded() {
        let policy = RetryPolicy::default();
        let mut calls = 0u32;
        let out: Option<()> = policy.run("test", |_| {
            calls += 1;
            Attempt::Retry
        });
        assert!(out.is_none());
        assert_eq!(calls, DEFAULT_MAX_RETRIES + 1);
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let policy = RetryPolicy {
            max_retries: 0,
            yield_between: false,
        };
        let mut calls = 0u32;
        let _: Option<()> = policy.run("test", |_| {
            calls += 1;
            Attempt::Retry
        });
        assert_eq!(calls, 1);
    }
}
