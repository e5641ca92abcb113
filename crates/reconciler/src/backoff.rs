//! Per-record retry backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use enactor_core::RecordKey;
use tokio::time::Instant;

use crate::record::Record;

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    /// Spec version the failures were observed on.
    updated_at: DateTime<Utc>,
    failures: u32,
    next_attempt_at: Instant,
}

/// Tracks transient failures per record.
///
/// State is dropped as soon as the record's spec changes, so a fixed spec is
/// retried immediately.
#[derive(Debug)]
pub struct RetryTracker {
    base: Duration,
    max: Duration,
    states: DashMap<RecordKey, RetryState>,
}

impl RetryTracker {
    /// Create a tracker.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            states: DashMap::new(),
        }
    }

    /// Whether the record may be attempted now.
    pub fn is_due(&self, record: &Record, now: Instant) -> bool {
        let key = record.key();
        let Some(state) = self.states.get(&key).map(|s| *s) else {
            return true;
        };

        if state.updated_at != record.updated_at {
            self.states.remove(&key);
            return true;
        }
        now >= state.next_attempt_at
    }

    /// Note a transient failure and return the delay before the next attempt.
    pub fn record_failure(&self, record: &Record, now: Instant) -> Duration {
        let mut entry = self.states.entry(record.key()).or_insert(RetryState {
            updated_at: record.updated_at,
            failures: 0,
            next_attempt_at: now,
        });

        if entry.updated_at != record.updated_at {
            entry.updated_at = record.updated_at;
            entry.failures = 0;
        }

        let delay = calculate_backoff(entry.failures, self.base, self.max);
        entry.failures = entry.failures.saturating_add(1);
        entry.next_attempt_at = now.checked_add(delay).unwrap_or(now);
        delay
    }

    /// Forget a record after success or a permanent failure.
    pub fn clear(&self, key: &RecordKey) {
        self.states.remove(key);
    }

    /// Consecutive transient failures for a record.
    pub fn failures(&self, key: &RecordKey) -> u32 {
        self.states.get(key).map_or(0, |s| s.failures)
    }
}
