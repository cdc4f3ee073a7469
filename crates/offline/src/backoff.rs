//! Retry policy for transient submission failures.

use std::time::Duration;

/// Delay before the N-th retry (1-based): 1s, 2s, 5s, 10s, 30s.
pub const DEFAULT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retry policy for queue items.
///
/// Delays come from a fixed table indexed by the retry count; counts past the
/// end of the table reuse its last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    steps: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            steps: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Replace the delay table. An empty table means "retry immediately".
    pub fn with_steps(mut self, steps: impl Into<Vec<Duration>>) -> Self {
        self.steps = steps.into();
        self
    }

    /// Delay to wait after the `retry_count`-th failure.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if self.steps.is_empty() || retry_count == 0 {
            return Duration::ZERO;
        }
        let idx = (retry_count as usize - 1).min(self.steps.len() - 1);
        self.steps[idx]
    }

    /// Whether an item that has failed `retry_count` times may run again.
    pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }
}
