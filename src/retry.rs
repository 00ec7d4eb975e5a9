//! Retry policies for activity scheduling.
//!
//! A policy is evaluated inside orchestration code, so every attempt and
//! every backoff delay lands in history and replays without re-executing the
//! activity. The policy itself must be deterministic: it may look only at the
//! failure message and the attempt number (plus the recorded elapsed time).

use std::sync::Arc;

/// Decision hook: given the failure message and the 1-based attempt number,
/// return the delay before the next attempt, or `None` to stop retrying.
pub type RetryDecision = Arc<dyn Fn(&str, u32) -> Option<u64> + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub first_delay_ms: u64,
    /// Multiplier applied per subsequent attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Overall budget across all attempts and delays; exceeded means stop.
    pub retry_timeout_ms: Option<u64>,
    /// Custom decision overriding the built-in backoff entirely.
    pub decision: Option<RetryDecision>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_delay_ms", &self.first_delay_ms)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("retry_timeout_ms", &self.retry_timeout_ms)
            .field("decision", &self.decision.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, first_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_delay_ms,
            backoff_coefficient: 1.0,
            max_delay_ms: u64::MAX,
            retry_timeout_ms: None,
            decision: None,
        }
    }

    pub fn with_backoff(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_retry_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.retry_timeout_ms = Some(timeout_ms);
        self
    }

    /// Install a custom decision function. It sees the failure message and
    /// the attempt number; returning `None` stops retrying. `max_attempts`
    /// and the overall timeout still apply.
    pub fn with_decision(
        mut self,
        decision: impl Fn(&str, u32) -> Option<u64> + Send + Sync + 'static,
    ) -> Self {
        self.decision = Some(Arc::new(decision));
        self
    }

    /// Delay before the attempt after `attempt` (1-based), or `None` when
    /// retries are exhausted, declined, or the overall budget is spent.
    pub fn next_delay_ms(&self, failure: &str, attempt: u32, elapsed_ms: u64) -> Option<u64> {
        if attempt >= self.max_attempts {
            return None;
        }
        if let Some(budget) = self.retry_timeout_ms {
            if elapsed_ms >= budget {
                return None;
            }
        }
        if let Some(decision) = &self.decision {
            return decision(failure, attempt);
        }
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.first_delay_ms as f64 * factor).round() as u64;
        Some(delay.min(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_sequence() {
        let policy = RetryPolicy::new(4, 1_000).with_backoff(2.0);
        assert_eq!(policy.next_delay_ms("e", 1, 0), Some(1_000));
        assert_eq!(policy.next_delay_ms("e", 2, 0), Some(2_000));
        assert_eq!(policy.next_delay_ms("e", 3, 0), Some(4_000));
        assert_eq!(policy.next_delay_ms("e", 4, 0), None);
    }

    #[test]
    fn max_delay_caps_backoff() {
        let policy = RetryPolicy::new(10, 1_000)
            .with_backoff(10.0)
            .with_max_delay_ms(5_000);
        assert_eq!(policy.next_delay_ms("e", 3, 0), Some(5_000));
    }

    #[test]
    fn overall_timeout_stops_retries() {
        let policy = RetryPolicy::new(10, 100).with_retry_timeout_ms(1_000);
        assert_eq!(policy.next_delay_ms("e", 1, 500), Some(100));
        assert_eq!(policy.next_delay_ms("e", 1, 1_000), None);
    }

    #[test]
    fn custom_decision_overrides_backoff() {
        let policy = RetryPolicy::new(5, 1_000).with_decision(|failure, attempt| {
            if failure.contains("fatal") {
                None
            } else {
                Some(attempt as u64 * 10)
            }
        });
        assert_eq!(policy.next_delay_ms("transient", 2, 0), Some(20));
        assert_eq!(policy.next_delay_ms("fatal: no", 2, 0), None);
    }
}
