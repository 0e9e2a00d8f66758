/// Retry policy: exponential backoff with full jitter, bounded by a
/// dead-letter threshold.
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff base for the exponential curve
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Attempt count at which work is dead-lettered
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Advisory delay before the given attempt is retried:
    /// `uniform(0, min(base * 2^attempt, max_delay))`.
    ///
    /// Full jitter keeps a burst of failing rows from re-arriving in
    /// lockstep. The value is logged for operators; the actual retry
    /// happens whenever the row is claimed again.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(63) as i32);
        let cap = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        if cap <= 0.0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0.0..=cap);
        Duration::from_secs_f64(jittered)
    }

    /// Whether the attempt count has exhausted the retry budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
