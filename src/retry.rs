//! Retry strategy (spec.md §4.7).
//!
//! A direct translation of `examples/original_source/async_grpc/retry.cc`:
//! a `RetryStrategy` is a pure value composed from an indicator (should we
//! retry at all) and a delay calculator (how long to wait before the next
//! attempt), and `retry_with_strategy` is the generic loop that decorates
//! any fail-and-reset operation with it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::status::{Code, Status};

/// `(failed_attempts, &Status) -> bool` — should we try again?
pub type RetryIndicator = Arc<dyn Fn(u32, &Status) -> bool + Send + Sync>;

/// `failed_attempts -> Duration` — how long to wait before the next attempt.
///
/// `failed_attempts` starts at 1 on the first failure (spec.md §9 "Open
/// questions", resolving the source's undefined behavior at
/// `failed_attempts == 0`).
pub type RetryDelayCalculator = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// `(failed_attempts, &Status) -> Option<Duration>`: `None` means give up.
#[derive(Clone)]
pub struct RetryStrategy {
    indicator: RetryIndicator,
    delay_calculator: RetryDelayCalculator,
}

impl RetryStrategy {
    pub fn new(indicator: RetryIndicator, delay_calculator: RetryDelayCalculator) -> Self {
        Self { indicator, delay_calculator }
    }

    fn next_delay(&self, failed_attempts: u32, status: &Status) -> Option<Duration> {
        if !(self.indicator)(failed_attempts, status) {
            return None;
        }
        Some((self.delay_calculator)(failed_attempts))
    }
}

/// Retries unconditionally, forever.
pub fn unlimited_retry_indicator() -> RetryIndicator {
    Arc::new(|_failed_attempts, _status| true)
}

/// Retries unconditionally except for the given set of unrecoverable codes.
pub fn unlimited_retry_except(unrecoverable_codes: HashSet<Code>) -> RetryIndicator {
    Arc::new(move |_failed_attempts, status| !unrecoverable_codes.contains(&status.code()))
}

/// Retries up to `max_attempts` times.
pub fn limited_retry_indicator(max_attempts: u32) -> RetryIndicator {
    Arc::new(move |failed_attempts, _status| failed_attempts < max_attempts)
}

/// A fixed delay between every attempt.
pub fn constant_delay(delay: Duration) -> RetryDelayCalculator {
    Arc::new(move |_failed_attempts| delay)
}

/// `k^(attempt-1) * min_delay`, i.e. exponential backoff with a floor.
pub fn backoff_delay(min_delay: Duration, backoff_factor: f64) -> RetryDelayCalculator {
    Arc::new(move |failed_attempts| {
        debug_assert!(failed_attempts >= 1);
        let scale = backoff_factor.powi(failed_attempts as i32 - 1);
        min_delay.mul_f64(scale)
    })
}

pub fn limited_backoff_strategy(
    min_delay: Duration,
    backoff_factor: f64,
    max_attempts: u32,
) -> RetryStrategy {
    RetryStrategy::new(limited_retry_indicator(max_attempts), backoff_delay(min_delay, backoff_factor))
}

pub fn unlimited_constant_delay_strategy(delay: Duration) -> RetryStrategy {
    RetryStrategy::new(unlimited_retry_indicator(), constant_delay(delay))
}

pub fn unlimited_constant_delay_strategy_except(
    delay: Duration,
    unrecoverable_codes: HashSet<Code>,
) -> RetryStrategy {
    RetryStrategy::new(unlimited_retry_except(unrecoverable_codes), constant_delay(delay))
}

/// Runs `op` in a loop, retrying per `strategy` until it succeeds, the
/// strategy gives up, or there is no strategy at all (spec.md §4.7).
///
/// `reset` is invoked after each sleep, before the next attempt, so the
/// caller can refresh attempt-scoped state (e.g. a fresh client context).
/// Retry is only meaningful for unary calls: the caller is responsible for
/// never handing this a streaming operation (spec.md §4.7 "Retry is only
/// legal for unary RPCs").
pub fn retry_with_strategy(
    strategy: Option<&RetryStrategy>,
    mut op: impl FnMut() -> Status,
    mut reset: impl FnMut(),
) -> bool {
    let mut failed_attempts: u32 = 0;
    loop {
        let status = op();
        if status.is_ok() {
            return true;
        }
        let Some(strategy) = strategy else {
            return false;
        };
        failed_attempts += 1;
        let Some(delay) = strategy.next_delay(failed_attempts, &status) else {
            return false;
        };
        info!(delay_ms = delay.as_millis() as u64, "retrying after delay");
        std::thread::sleep(delay);
        reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn succeeds_without_retry_when_op_is_ok() {
        let attempts = AtomicU32::new(0);
        let ok = retry_with_strategy(
            Some(&unlimited_constant_delay_strategy(Duration::from_millis(1))),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Status::ok()
            },
            || {},
        );
        assert!(ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unrecoverable_code_stops_after_one_attempt() {
        let attempts = AtomicU32::new(0);
        let mut unrecoverable = HashSet::new();
        unrecoverable.insert(Code::Internal);
        let strategy = unlimited_constant_delay_strategy_except(Duration::from_secs(1), unrecoverable);
        let start = Instant::now();
        let ok = retry_with_strategy(
            Some(&strategy),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Status::internal("boom")
            },
            || {},
        );
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(500), "should not have slept");
    }

    #[test]
    fn limited_attempts_eventually_give_up() {
        let attempts = AtomicU32::new(0);
        let strategy = limited_backoff_strategy(Duration::from_millis(1), 2.0, 3);
        let ok = retry_with_strategy(
            Some(&strategy),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Status::internal("still broken")
            },
            || {},
        );
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn no_strategy_fails_fast() {
        let attempts = AtomicU32::new(0);
        let ok = retry_with_strategy(
            None,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Status::internal("nope")
            },
            || {},
        );
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_delay_uses_attempt_minus_one_as_exponent() {
        let calc = backoff_delay(Duration::from_millis(10), 2.0);
        assert_eq!(calc(1), Duration::from_millis(10));
        assert_eq!(calc(2), Duration::from_millis(20));
        assert_eq!(calc(3), Duration::from_millis(40));
    }
}
