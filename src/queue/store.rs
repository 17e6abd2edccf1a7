use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use crate::queue::entry::QueueEntry;
use crate::queue::error::StoreError;

/// Failed entries are never retried later than this far in the future.
const MAX_RETRY_BACKOFF_SECS: i64 = 3600;

/// Failed entries expire instead of rescheduling once they have failed
/// this many times.
pub(crate) const MAX_FAIL_COUNT: i32 = 10;

/// Durable store for queue entries.
///
/// All concurrency control lives in the backend: `lock_next` must hand a
/// given entry to at most one caller at a time, across processes, by
/// stamping a claim lease. Workers renew the lease via `extend` while
/// performing, so a lapsed lease means the claim holder died and the
/// entry may be handed out again.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends a new entry, eligible to run at `run_at`.
    async fn enqueue(
        &self,
        queue_name: &str,
        args: JsonValue,
        run_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError>;

    /// Claims the oldest eligible entry of the queue, if any.
    ///
    /// Eligible means: due, not finalized, and not covered by a live
    /// claim lease.
    async fn lock_next(&self, queue_name: &str) -> Result<Option<QueueEntry>, StoreError>;

    /// Renews the claim lease on an entry held by this worker.
    async fn extend(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Marks the entry completed. Terminal.
    async fn done(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Marks the entry expired with a reason, so it never runs. Terminal.
    async fn expire(&self, entry: &QueueEntry, reason: &str) -> Result<(), StoreError>;

    /// Records a failed attempt: bumps the error count, stores the error
    /// text, releases the claim, and pushes `run_at` into the future so
    /// the entry is retried with backoff. Entries that keep failing
    /// expire after ten attempts.
    async fn fail(&self, entry: &QueueEntry, error: &str) -> Result<(), StoreError>;
}

/// Delay before the next attempt of an entry that has now failed
/// `error_count` times: exponential in the attempt number, capped.
pub(crate) fn retry_backoff(base_secs: u64, error_count: i32) -> Duration {
    let exponent = (error_count - 1).clamp(0, 8) as u32;
    let secs = (base_secs as i64)
        .saturating_mul(1i64 << exponent)
        .min(MAX_RETRY_BACKOFF_SECS);
    Duration::seconds(secs)
}
