//! Per-URL retry bookkeeping.
//!
//! Only one situation is retried: a `503 Service Unavailable` that asks for
//! an immediate retry with `Retry-After: 0`. Network errors and every other
//! status settle the URL on the first attempt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use crate::error::FetchResult;
use crate::types::FetchResponse;

/// Retry ceiling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first request (so `max_retries + 1`
    /// requests at most).
    pub max_retries: u32,
    /// Retries allowed for a 503 that carries no `Retry-After` at all.
    pub absent_retry_after_allowance: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            absent_retry_after_allowance: 0,
        }
    }
}

impl RetryPolicy {
    fn allowance(&self, retry_after: Option<u64>) -> u32 {
        match retry_after {
            Some(0) => self.max_retries,
            None => self.absent_retry_after_allowance.min(self.max_retries),
            Some(_) => 0,
        }
    }
}

/// Attempts made for one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchAttempt {
    /// Requests issued so far.
    pub count: u32,
    /// Description of the last unsuccessful outcome.
    pub last_error: Option<String>,
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Issue the same request again now.
    Retry,
    /// Accept the outcome as final.
    Finish,
}

/// `URL -> FetchAttempt` table.
#[derive(Debug, Clone, Default)]
pub struct RetryTable {
    policy: RetryPolicy,
    attempts: HashMap<Url, FetchAttempt>,
}

impl RetryTable {
    /// Creates an empty table.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: HashMap::new(),
        }
    }

    /// Records the outcome of one request for `url` and decides whether to
    /// retry it.
    pub fn record(&mut self, url: &Url, outcome: &FetchResult<FetchResponse>) -> RetryDecision {
        let attempt = self.attempts.entry(url.clone()).or_default();
        attempt.count += 1;

        let response = match outcome {
            Ok(response) if response.is_success() || response.is_not_modified() => {
                return RetryDecision::Finish;
            }
            Ok(response) => response,
            Err(error) => {
                attempt.last_error = Some(error.to_string());
                return RetryDecision::Finish;
            }
        };

        attempt.last_error = Some(format!("HTTP {}", response.status));
        if response.status != 503 {
            return RetryDecision::Finish;
        }

        let retries_done = attempt.count - 1;
        if retries_done < self.policy.allowance(response.retry_after()) {
            tracing::debug!(url = %url, attempt = attempt.count, "retrying 503");
            RetryDecision::Retry
        } else {
            if retries_done > 0 {
                tracing::warn!(url = %url, attempts = attempt.count, "retries exhausted");
            }
            RetryDecision::Finish
        }
    }

    /// Attempts recorded for `url`.
    pub fn attempt(&self, url: &Url) -> Option<&FetchAttempt> {
        self.attempts.get(url)
    }

    /// Forgets the counters of `url`.
    pub fn reset(&mut self, url: &Url) {
        self.attempts.remove(url);
    }

    /// The policy in effect.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}
