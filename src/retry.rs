//! Fixed-delay retry combinator.
//!
//! Runs an operation up to `max_attempts` times, sleeping `delay` between
//! attempts (never after the last one), until a caller-supplied predicate
//! accepts the result. The last result is always returned so the caller can
//! classify an exhausted run.

use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// The final result of a retried call.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    /// Calls made, 1-based.
    pub attempts: u32,
    /// Whether the predicate accepted `value`.
    pub succeeded: bool,
}

/// Call `op(attempt)` until `is_success` accepts its result or the attempt
/// budget runs out. `attempt` starts at 1.
pub fn retry<T>(
    policy: RetryPolicy,
    mut op: impl FnMut(u32) -> T,
    is_success: impl Fn(&T) -> bool,
) -> Retried<T> {
    retry_with_sleep(policy, &mut op, is_success, std::thread::sleep)
}

fn retry_with_sleep<T>(
    policy: RetryPolicy,
    op: &mut impl FnMut(u32) -> T,
    is_success: impl Fn(&T) -> bool,
    mut sleep: impl FnMut(Duration),
) -> Retried<T> {
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let value = op(attempt);
        if is_success(&value) {
            return Retried {
                value,
                attempts: attempt,
                succeeded: true,
            };
        }
        if attempt >= max {
            return Retried {
                value,
                attempts: attempt,
                succeeded: false,
            };
        }
        debug!(attempt, max, delay_ms = policy.delay.as_millis() as u64, "retrying");
        if !policy.delay.is_zero() {
            sleep(policy.delay);
        }
        attempt += 1;
    }
}
