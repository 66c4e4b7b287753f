//! Per-sender sliding window counter.

use chrono::{DateTime, DurationRound, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Recording would push a bucket or the aggregate count past `u64::MAX`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("recipient count overflow for bucket {bucket}")]
pub struct CountOverflow {
    pub bucket: DateTime<Utc>,
}

/// Recent send activity for one sender.
///
/// Activity is aggregated into one-minute buckets, so pruning costs one
/// step per distinct minute with traffic rather than per message. The
/// aggregate count is kept in step with the buckets on every mutation.
#[derive(Debug)]
pub struct RateToken {
    key: String,
    state: Mutex<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    buckets: HashMap<DateTime<Utc>, u64>,
    count: u64,
    bucket_count: usize,
}

/// Truncate a timestamp to the start of its minute.
pub fn bucket_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at)
}

impl RateToken {
    /// Create an empty token for `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(TokenState::default()),
        }
    }

    /// The sender this token tracks.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Drop every bucket that started strictly before `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) {
        let mut state = self.state.lock();
        let TokenState {
            buckets,
            count,
            bucket_count,
        } = &mut *state;

        buckets.retain(|start, recipients| {
            if *start < cutoff {
                trace!(
                    sender = %self.key,
                    bucket = %start,
                    recipients = *recipients,
                    "Pruning expired bucket"
                );
                *count -= *recipients;
                *bucket_count -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Add `recipients` to the bucket for the minute containing `at`.
    ///
    /// Leaves the token untouched and returns [`CountOverflow`] if either
    /// the bucket or the aggregate count would overflow.
    pub fn record(&self, at: DateTime<Utc>, recipients: u64) -> Result<(), CountOverflow> {
        let start = bucket_start(at);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        trace!(
            sender = %self.key,
            count = state.count,
            buckets = state.bucket_count,
            bucket = %start,
            recipients,
            "Recording message"
        );

        let overflow = CountOverflow { bucket: start };
        let count = state.count.checked_add(recipients).ok_or(overflow)?;

        match state.buckets.entry(start) {
            Entry::Occupied(mut bucket) => {
                let total = bucket.get().checked_add(recipients).ok_or(overflow)?;
                *bucket.get_mut() = total;
            }
            Entry::Vacant(bucket) => {
                bucket.insert(recipients);
                state.bucket_count += 1;
            }
        }
        state.count = count;
        Ok(())
    }

    /// Cached number of recipients across all buckets.
    ///
    /// Never prunes; call [`RateToken::prune`] first for an up-to-date value.
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn bucket_count(&self) -> usize {
        self.state.lock().bucket_count
    }

    /// Copy of the buckets ordered by start time.
    pub fn buckets(&self) -> Vec<(DateTime<Utc>, u64)> {
        let state = self.state.lock();
        let mut buckets: Vec<_> = state.buckets.iter().map(|(k, v)| (*k, *v)).collect();
        buckets.sort_unstable_by_key(|(start, _)| *start);
        buckets
    }
}
