use resource_fetcher::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning of update jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Immediate retries of a `503` with `Retry-After: 0`.
    pub max_retries: u32,
    /// Retries of a `503` without any `Retry-After`.
    pub absent_retry_after_allowance: u32,
    /// Resource fetches in flight at once.
    pub max_concurrent_fetches: usize,
    /// Delay before updates queued behind a finishing job start.
    pub restart_delay: Duration,
    /// Chunk size used when streaming bodies through storage.
    pub read_chunk_size: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            absent_retry_after_allowance: 0,
            max_concurrent_fetches: 2,
            restart_delay: Duration::from_secs(1),
            read_chunk_size: 32 * 1024,
        }
    }
}

impl UpdateConfig {
    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the allowance for `503` without `Retry-After`.
    pub fn with_absent_retry_after_allowance(mut self, allowance: u32) -> Self {
        self.absent_retry_after_allowance = allowance;
        self
    }

    /// Sets the fetch concurrency; zero is treated as one.
    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max.max(1);
        self
    }

    /// Sets the restart delay.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Sets the streaming chunk size; zero is treated as one.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Retry policy for the fetch retry table.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            absent_retry_after_allowance: self.absent_retry_after_allowance,
        }
    }
}
