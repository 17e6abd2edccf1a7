use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::schema::queue_entries;

/// One durable queue entry: a pending, claimed, completed, or expired
/// job invocation.
///
/// Claims are leases: `locked_until` in the future means some worker owns
/// the entry, and a lapsed lease makes it claimable again. `done_at` and
/// `expired_at` are mutually exclusive terminal markers.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = queue_entries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct QueueEntry {
    pub id: i64,
    pub queue_name: String,
    pub args: JsonValue,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub expire_reason: Option<String>,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Whether the entry reached a terminal marker and will never run again.
    pub fn is_finalized(&self) -> bool {
        self.done_at.is_some() || self.expired_at.is_some()
    }

    /// Whether the entry is eligible for claiming at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_finalized()
            && self.run_at <= now
            && self.locked_until.map(|until| until < now).unwrap_or(true)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = queue_entries)]
pub struct NewQueueEntry {
    pub queue_name: String,
    pub args: JsonValue,
    pub run_at: DateTime<Utc>,
}
