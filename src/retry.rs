//! Reconnect backoff arithmetic (spec §4.3).
//!
//! Grounded on the teacher's `retry_strategies.rs`, which drives
//! `tokio_retry`'s `ExponentialBackoff` with a jitter map and a fixed
//! retry count. This crate needs an unbounded-attempts mode and a
//! cumulative wall-clock budget in addition to an attempt count (spec
//! §4.3's "retry budget" is either-or across attempts and total time), so
//! the arithmetic is hand-rolled here rather than reused as-is. Unlike
//! `tokio_retry`'s stateless exponent formula, spec §4.3's recurrence is
//! stateful — `retry_delay = round(retry_delay * retry_backoff)` mutates
//! one running value every attempt instead of recomputing `base *
//! factor^attempt` from scratch — so `RetryBudget` carries that running
//! delay as a field.

use crate::config::{ClientConfig, RetryContext, RetryDecision};
use std::time::{Duration, Instant};

/// Tracks the state of an in-progress reconnect loop: how many attempts
/// have been made, when the loop started, and the running backoff delay
/// (spec §4.3's `attempts`/`retry_total_ms`/`retry_delay`).
pub struct RetryBudget {
    attempt: u32,
    started_at: Instant,
    retry_delay: Duration,
}

impl RetryBudget {
    pub fn new(config: &ClientConfig) -> Self {
        RetryBudget {
            attempt: 0,
            started_at: Instant::now(),
            retry_delay: config.retry_base_delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The cumulative budget a disconnect is checked against. Spec §4.3's
    /// state vector has no field distinct from `connect_timeout_ms` for
    /// this, so `max_retry_time` narrows it when set and `connect_timeout`
    /// is the fallback otherwise.
    fn budget(config: &ClientConfig) -> Duration {
        config.max_retry_time.unwrap_or(config.connect_timeout)
    }

    /// Computes the decision for the next reconnect attempt and advances
    /// the attempt counter. Delegates to `config.retry_strategy` when the
    /// caller supplied one; otherwise applies spec §4.3 step 8's caps to
    /// the running delay and advances it per the step 9 recurrence.
    pub fn next(&mut self, config: &ClientConfig) -> RetryDecision {
        self.attempt += 1;

        if let Some(max_attempts) = config.max_reconnect_attempts {
            if self.attempt > max_attempts {
                return RetryDecision::Stop;
            }
        }

        let budget = Self::budget(config);
        let elapsed = self.elapsed();
        if elapsed >= budget {
            return RetryDecision::Stop;
        }

        if let Some(strategy) = &config.retry_strategy {
            return strategy(RetryContext {
                attempt: self.attempt,
                elapsed,
            });
        }

        // Step 8: retry_delay = min(retry_delay, retry_max_delay), then
        // min(retry_delay, connect_timeout_ms - retry_total_ms).
        self.retry_delay = self.retry_delay.min(config.retry_max_delay);
        let remaining = budget.saturating_sub(elapsed);
        self.retry_delay = self.retry_delay.min(remaining);
        let delay = self.retry_delay;

        // Step 9 (inside `retry_connection`): retry_delay = round(retry_delay
        // * retry_backoff), preparing the value for the *next* disconnect.
        self.retry_delay = self.retry_delay.mul_f64(config.retry_backoff);

        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(base: Duration, max: Duration, backoff: f64) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.retry_base_delay = base;
        config.retry_max_delay = max;
        config.retry_backoff = backoff;
        config
    }

    #[test]
    fn backoff_grows_by_the_configured_factor_and_is_capped() {
        let config = config_with(Duration::from_millis(50), Duration::from_secs(2), 1.7);
        let mut budget = RetryBudget::new(&config);

        let Ok(d1) = expect_retry(budget.next(&config)) else {
            unreachable!()
        };
        let d2 = expect_retry(budget.next(&config)).unwrap();
        let d3 = expect_retry(budget.next(&config)).unwrap();
        assert_eq!(d1, Duration::from_millis(50));
        assert_eq!(d2, Duration::from_millis(85));
        assert!(d3 > d2);
        assert!(d3 <= Duration::from_secs(2));
    }

    fn expect_retry(decision: RetryDecision) -> Result<Duration, ()> {
        match decision {
            RetryDecision::RetryAfter(d) => Ok(d),
            RetryDecision::Stop => Err(()),
        }
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut config = ClientConfig::default();
        config.max_reconnect_attempts = Some(2);
        let mut budget = RetryBudget::new(&config);
        assert!(matches!(budget.next(&config), RetryDecision::RetryAfter(_)));
        assert!(matches!(budget.next(&config), RetryDecision::RetryAfter(_)));
        assert!(matches!(budget.next(&config), RetryDecision::Stop));
    }

    #[test]
    fn falls_back_to_connect_timeout_when_max_retry_time_unset() {
        let mut config = ClientConfig::default();
        config.connect_timeout = Duration::from_millis(30);
        config.retry_base_delay = Duration::from_millis(10);
        config.retry_max_delay = Duration::from_millis(10);
        let mut budget = RetryBudget::new(&config);
        assert!(matches!(budget.next(&config), RetryDecision::RetryAfter(_)));
        std::thread::sleep(Duration::from_millis(35));
        assert!(matches!(budget.next(&config), RetryDecision::Stop));
    }

    #[test]
    fn clamps_delay_to_remaining_budget_on_the_final_attempt() {
        let mut config = ClientConfig::default();
        config.max_retry_time = Some(Duration::from_millis(120));
        config.retry_base_delay = Duration::from_millis(100);
        config.retry_max_delay = Duration::from_secs(10);
        config.retry_backoff = 1.0;
        let mut budget = RetryBudget::new(&config);

        let first = expect_retry(budget.next(&config)).expect("first retry");
        assert_eq!(first, Duration::from_millis(100));

        std::thread::sleep(Duration::from_millis(100));
        let second = expect_retry(budget.next(&config)).expect("clamped retry, not Stop");
        assert!(second < Duration::from_millis(100));
    }

    #[test]
    fn custom_strategy_overrides_default() {
        let mut config = ClientConfig::default();
        config.retry_strategy = Some(Box::new(|ctx| {
            if ctx.attempt > 1 {
                RetryDecision::Stop
            } else {
                RetryDecision::RetryAfter(Duration::from_millis(1))
            }
        }));
        let mut budget = RetryBudget::new(&config);
        assert!(matches!(budget.next(&config), RetryDecision::RetryAfter(_)));
        assert!(matches!(budget.next(&config), RetryDecision::Stop));
    }
}
