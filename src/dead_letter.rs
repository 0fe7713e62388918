//! Dead-letter capture for rows that failed normalization or persistence.
//!
//! Entries are keyed by source row id, retried on an exponential backoff
//! schedule, capped at a maximum retry count, and kept for audit after
//! resolution.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Retry scheduling knobs for dead-lettered rows.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the computed backoff.
    pub ceiling: Duration,
    /// Retries stop once an entry reaches this count; the row then stays
    /// dead-lettered until an operator intervenes.
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::seconds(60),
            ceiling: Duration::hours(4),
            max_retries: 8,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given retry count: `base * 2^(count - 1)`,
    /// capped at the ceiling.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = (retry_count - 1).clamp(0, 30) as u32;
        match self.base.checked_mul(1 << exponent) {
            Some(delay) if delay < self.ceiling => delay,
            _ => self.ceiling,
        }
    }

    /// Cap a retry count: `min(max_retries, prior + 1)`.
    pub fn next_count(&self, prior: Option<i32>) -> i32 {
        (prior.unwrap_or(0) + 1).min(self.max_retries)
    }
}

/// Durable record of a row that failed to apply.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Source row id; unique per entry.
    pub source_id: String,
    pub payment_intent_id: Option<String>,
    /// Last-known raw payload of the source row.
    pub payload: serde_json::Value,
    pub error: String,
    pub retry_count: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// Set once the row later syncs successfully; cleared again if it fails
    /// after that.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    /// Build the entry to write for a fresh failure, incrementing the retry
    /// count from any prior entry and rescheduling via the policy's backoff.
    pub fn next_attempt(
        prior: Option<&DeadLetterEntry>,
        policy: &RetryPolicy,
        source_id: &str,
        payment_intent_id: Option<String>,
        payload: serde_json::Value,
        error: String,
        now: DateTime<Utc>,
    ) -> DeadLetterEntry {
        let retry_count = policy.next_count(prior.map(|e| e.retry_count));
        DeadLetterEntry {
            source_id: source_id.to_string(),
            payment_intent_id,
            payload,
            error,
            retry_count,
            next_retry_at: now + policy.backoff(retry_count),
            last_failed_at: now,
            resolved_at: None,
        }
    }

    /// Whether the entry is still eligible for automatic retry.
    pub fn retryable(&self, policy: &RetryPolicy) -> bool {
        self.resolved_at.is_none() && self.retry_count < policy.max_retries
    }
}
