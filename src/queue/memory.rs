//! In-memory queue store for tests and single-process setups.
//!
//! Mirrors the claim semantics of the PostgreSQL store: entries are
//! handed out under a lease and finalizing updates are guarded, so code
//! exercised against this backend observes the same at-most-one-claimant
//! behavior.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::config::settings::QueueConfig;
use crate::queue::entry::QueueEntry;
use crate::queue::error::StoreError;
use crate::queue::store::{MAX_FAIL_COUNT, QueueStore, retry_backoff};

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<i64, QueueEntry>,
    next_id: i64,
}

/// Queue store backed by a mutexed map.
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
    config: QueueConfig,
}

impl MemoryQueueStore {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            config,
        }
    }

    /// Snapshot of a single entry, mainly for assertions in tests.
    pub fn get(&self, entry_id: i64) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.state()?.entries.get(&entry_id).cloned())
    }

    /// Snapshot of all entries of one queue, ordered by id.
    pub fn entries_for(&self, queue: &str) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self
            .state()?
            .entries
            .values()
            .filter(|entry| entry.queue_name == queue)
            .cloned()
            .collect())
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::query("lock in-memory state", anyhow::anyhow!(e.to_string())))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: JsonValue,
        eligible_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        let mut state = self.state()?;
        state.next_id += 1;
        let entry = QueueEntry {
            id: state.next_id,
            queue_name: queue.to_string(),
            args: payload,
            run_at: eligible_at,
            locked_until: None,
            done_at: None,
            expired_at: None,
            expire_reason: None,
            error_count: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn lock_next(&self, queue: &str) -> Result<Option<QueueEntry>, StoreError> {
        let mut state = self.state()?;
        let now = Utc::now();

        let candidate = state
            .entries
            .values()
            .filter(|entry| entry.queue_name == queue && entry.is_claimable(now))
            .min_by_key(|entry| (entry.run_at, entry.id))
            .map(|entry| entry.id);

        match candidate {
            Some(entry_id) => {
                let lease = self.config.lock_lease();
                let entry = state
                    .entries
                    .get_mut(&entry_id)
                    .ok_or(StoreError::LostClaim(entry_id))?;
                entry.locked_until = Some(now + lease);
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn extend(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let lease = self.config.lock_lease();
        let stored = state
            .entries
            .get_mut(&entry.id)
            .filter(|stored| !stored.is_finalized())
            .ok_or(StoreError::LostClaim(entry.id))?;
        stored.locked_until = Some(Utc::now() + lease);
        Ok(())
    }

    async fn done(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let stored = state
            .entries
            .get_mut(&entry.id)
            .filter(|stored| !stored.is_finalized())
            .ok_or(StoreError::LostClaim(entry.id))?;
        stored.done_at = Some(Utc::now());
        Ok(())
    }

    async fn expire(&self, entry: &QueueEntry, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let stored = state
            .entries
            .get_mut(&entry.id)
            .filter(|stored| !stored.is_finalized())
            .ok_or(StoreError::LostClaim(entry.id))?;
        stored.expired_at = Some(Utc::now());
        stored.expire_reason = Some(reason.to_string());
        Ok(())
    }

    async fn fail(&self, entry: &QueueEntry, error: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let backoff_base = self.config.retry_backoff_secs;
        let stored = state
            .entries
            .get_mut(&entry.id)
            .filter(|stored| !stored.is_finalized())
            .ok_or(StoreError::LostClaim(entry.id))?;
        stored.error_count += 1;
        stored.last_error = Some(error.to_string());
        stored.locked_until = None;
        if stored.error_count >= MAX_FAIL_COUNT {
            stored.expired_at = Some(Utc::now());
            stored.expire_reason = Some(format!("retry limit reached: {error}"));
        } else {
            stored.run_at = Utc::now() + retry_backoff(backoff_base, stored.error_count);
        }
        Ok(())
    }
}
