//! PostgreSQL-backed queue store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a transaction so
//! concurrent workers never block each other on the same queue, plus a
//! lease on `locked_until` so entries owned by a crashed worker become
//! claimable again once the lease lapses. Never replace this with an
//! in-process mutex: the store is the only coordination point that works
//! across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::PooledConnection;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::Value as JsonValue;

use crate::config::settings::QueueConfig;
use crate::db::AsyncDbPool;
use crate::queue::entry::{NewQueueEntry, QueueEntry};
use crate::queue::error::StoreError;
use crate::queue::store::{MAX_FAIL_COUNT, QueueStore, retry_backoff};

/// Durable queue store on PostgreSQL.
///
/// Since `AsyncDbPool` (bb8::Pool) internally uses `Arc`, cloning is cheap
/// (just reference count increment).
#[derive(Clone)]
pub struct PgQueueStore {
    pool: AsyncDbPool,
    config: QueueConfig,
}

impl PgQueueStore {
    pub fn new(pool: AsyncDbPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool.get().await.map_err(StoreError::connection)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: JsonValue,
        eligible_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        use crate::schema::queue_entries::dsl::*;

        let mut conn = self.conn().await?;
        let new_entry = NewQueueEntry {
            queue_name: queue.to_string(),
            args: payload,
            run_at: eligible_at,
        };

        diesel::insert_into(queue_entries)
            .values(&new_entry)
            .returning(QueueEntry::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(|e| StoreError::query("enqueue queue entry", e))
    }

    async fn lock_next(&self, queue: &str) -> Result<Option<QueueEntry>, StoreError> {
        use crate::schema::queue_entries::dsl::*;

        let mut conn = self.conn().await?;
        let lease = self.config.lock_lease();

        conn.transaction::<Option<QueueEntry>, diesel::result::Error, _>(|conn| {
            async move {
                let now = Utc::now();
                let candidate = queue_entries
                    .filter(queue_name.eq(queue))
                    .filter(run_at.le(now))
                    .filter(done_at.is_null())
                    .filter(expired_at.is_null())
                    .filter(locked_until.is_null().or(locked_until.lt(now)))
                    .order(run_at.asc())
                    .then_order_by(id.asc())
                    .limit(1)
                    .for_update()
                    .skip_locked()
                    .select(QueueEntry::as_select())
                    .first(conn)
                    .await
                    .optional()?;

                match candidate {
                    Some(entry) => {
                        let claimed = diesel::update(queue_entries.find(entry.id))
                            .set(locked_until.eq(now + lease))
                            .returning(QueueEntry::as_returning())
                            .get_result(conn)
                            .await?;
                        Ok(Some(claimed))
                    }
                    None => Ok(None),
                }
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| StoreError::query("claim queue entry", e))
    }

    async fn extend(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        use crate::schema::queue_entries::dsl::*;

        let mut conn = self.conn().await?;
        let now = Utc::now();

        let rows = diesel::update(
            queue_entries
                .find(entry.id)
                .filter(done_at.is_null())
                .filter(expired_at.is_null()),
        )
        .set(locked_until.eq(now + self.config.lock_lease()))
        .execute(&mut conn)
        .await
        .map_err(|e| StoreError::query("extend queue entry lease", e))?;

        if rows == 0 {
            return Err(StoreError::LostClaim(entry.id));
        }
        Ok(())
    }

    async fn done(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        use crate::schema::queue_entries::dsl::*;

        let mut conn = self.conn().await?;

        let rows = diesel::update(
            queue_entries
                .find(entry.id)
                .filter(done_at.is_null())
                .filter(expired_at.is_null()),
        )
        .set(done_at.eq(Utc::now()))
        .execute(&mut conn)
        .await
        .map_err(|e| StoreError::query("complete queue entry", e))?;

        if rows == 0 {
            return Err(StoreError::LostClaim(entry.id));
        }
        Ok(())
    }

    async fn expire(&self, entry: &QueueEntry, reason: &str) -> Result<(), StoreError> {
        use crate::schema::queue_entries::dsl::*;

        let mut conn = self.conn().await?;

        let rows = diesel::update(
            queue_entries
                .find(entry.id)
                .filter(done_at.is_null())
                .filter(expired_at.is_null()),
        )
        .set((expired_at.eq(Utc::now()), expire_reason.eq(reason)))
        .execute(&mut conn)
        .await
        .map_err(|e| StoreError::query("expire queue entry", e))?;

        if rows == 0 {
            return Err(StoreError::LostClaim(entry.id));
        }
        Ok(())
    }

    async fn fail(&self, entry: &QueueEntry, error: &str) -> Result<(), StoreError> {
        use crate::schema::queue_entries::dsl::*;

        let mut conn = self.conn().await?;
        let now = Utc::now();
        let retries = entry.error_count + 1;

        let target = queue_entries
            .find(entry.id)
            .filter(done_at.is_null())
            .filter(expired_at.is_null());

        let rows = if retries >= MAX_FAIL_COUNT {
            diesel::update(target)
                .set((
                    error_count.eq(retries),
                    last_error.eq(error),
                    expired_at.eq(now),
                    expire_reason.eq(format!("retry limit reached: {error}")),
                    locked_until.eq(None::<DateTime<Utc>>),
                ))
                .execute(&mut conn)
                .await
        } else {
            let delay = retry_backoff(self.config.retry_backoff_secs, retries);
            diesel::update(target)
                .set((
                    error_count.eq(retries),
                    last_error.eq(error),
                    run_at.eq(now + delay),
                    locked_until.eq(None::<DateTime<Utc>>),
                ))
                .execute(&mut conn)
                .await
        }
        .map_err(|e| StoreError::query("record queue entry failure", e))?;

        if rows == 0 {
            return Err(StoreError::LostClaim(entry.id));
        }
        Ok(())
    }
}
