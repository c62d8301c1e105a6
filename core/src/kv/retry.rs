use std::time::Duration;

/// Exponential backoff policy for retryable KVS failures.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self { Self { max_attempts: 10, base_delay: Duration::from_millis(10), max_delay: Duration::from_secs(1) } }
}

impl RetryOptions {
    /// Delay before the retry following `attempt` (zero-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(16) as u32;
        self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}
