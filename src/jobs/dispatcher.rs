//! Per-definition dispatch loop.
//!
//! Each registered job definition gets one loop that polls its own
//! durable queue under a lock-rate cap, buffers claimed entries, and
//! starts handlers under a perform-rate cap and a concurrency cap. The
//! loop only coordinates; all cross-process exclusion stays in the queue
//! store's claim leases.
//!
//! A handler panic is recorded on the job record and then re-raised, so
//! it takes the loop down and becomes observable on the loop's join
//! handle. Handler errors, by contrast, are recorded and retried.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::heartbeat::HeartbeatMonitor;
use crate::jobs::payload;
use crate::jobs::registry::{DispatchLimits, JobDefinition};
use crate::jobs::types::{HandleLookup, JobContext, JobStatus};
use crate::queue::{QueueEntry, QueueStore, queue_name};

/// Reason recorded when a cancelled job's entry is discarded unrun.
pub(crate) const EXPIRE_REASON_CANCELLED: &str = "job is cancelled";
/// Reason recorded when a running job was killed out-of-band.
pub(crate) const EXPIRE_REASON_ABORTED: &str = "manually aborted";

pub(crate) struct DispatchLoop {
    store: Arc<dyn QueueStore>,
    definition: Arc<JobDefinition>,
    limits: DispatchLimits,
    lookup: HandleLookup,
    heartbeat_interval: Duration,
    queue_name: String,
    stop: CancellationToken,
}

impl DispatchLoop {
    pub(crate) fn new(
        store: Arc<dyn QueueStore>,
        definition: Arc<JobDefinition>,
        limits: DispatchLimits,
        lookup: HandleLookup,
        heartbeat_interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        let queue_name = queue_name(definition.name());
        Self {
            store,
            definition,
            limits,
            lookup,
            heartbeat_interval,
            queue_name,
            stop,
        }
    }

    /// Runs until the stop token trips, then drains in-flight handlers.
    pub(crate) async fn run(self) {
        let limits = self.limits;
        let mut lock_tick = tokio::time::interval(limits.lock_interval());
        lock_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut perform_tick = tokio::time::interval(limits.perform_interval());
        perform_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let permits = Arc::new(Semaphore::new(limits.max_concurrent_perform_count));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut buffered: VecDeque<QueueEntry> = VecDeque::new();

        tracing::info!(queue = %self.queue_name, "Dispatch loop started");

        loop {
            let headroom = (limits.max_buffer_jobs_count + permits.available_permits())
                .saturating_sub(buffered.len());

            tokio::select! {
                _ = self.stop.cancelled() => break,

                Some(result) = running.join_next(), if !running.is_empty() => {
                    Self::reap(result);
                }

                _ = lock_tick.tick(), if headroom > 0 => {
                    match self.store.lock_next(&self.queue_name).await {
                        Ok(Some(entry)) => buffered.push_back(entry),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(queue = %self.queue_name, error = %e, "Failed to poll queue");
                        }
                    }
                }

                _ = perform_tick.tick(), if !buffered.is_empty() && permits.available_permits() > 0 => {
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        continue;
                    };
                    if let Some(entry) = buffered.pop_front() {
                        let store = Arc::clone(&self.store);
                        let definition = Arc::clone(&self.definition);
                        let lookup = Arc::clone(&self.lookup);
                        let heartbeat_interval = self.heartbeat_interval;
                        running.spawn(async move {
                            let _permit = permit;
                            Self::perform_claimed(store, definition, lookup, heartbeat_interval, entry)
                                .await;
                        });
                    }
                }
            }
        }

        if !buffered.is_empty() {
            // Dropped claims simply lapse and become claimable again.
            tracing::debug!(
                queue = %self.queue_name,
                count = buffered.len(),
                "Dropping unstarted claims on shutdown"
            );
        }

        while let Some(result) = running.join_next().await {
            Self::reap(result);
        }
        tracing::info!(queue = %self.queue_name, "Dispatch loop stopped");
    }

    /// Re-raises worker panics so they surface on the loop's join handle.
    fn reap(result: Result<(), JoinError>) {
        if let Err(err) = result {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
            tracing::error!(error = %err, "Job worker task aborted");
        }
    }

    async fn perform_claimed(
        store: Arc<dyn QueueStore>,
        definition: Arc<JobDefinition>,
        lookup: HandleLookup,
        heartbeat_interval: Duration,
        entry: QueueEntry,
    ) {
        match Self::perform_entry(&store, &definition, &lookup, heartbeat_interval, &entry).await {
            Ok(()) => {}
            // The entry was already expired; nothing left to record.
            Err(JobError::Aborted) => {
                tracing::warn!(entry_id = entry.id, queue = %entry.queue_name, "Job manually aborted");
            }
            Err(e) => {
                tracing::error!(
                    entry_id = entry.id,
                    queue = %entry.queue_name,
                    error = %e,
                    "Job perform failed"
                );
                if let Err(record_err) = store.fail(&entry, &e.to_string()).await {
                    tracing::error!(
                        entry_id = entry.id,
                        error = %record_err,
                        "Failed to record job failure"
                    );
                }
            }
        }
    }

    async fn perform_entry(
        store: &Arc<dyn QueueStore>,
        definition: &Arc<JobDefinition>,
        lookup: &HandleLookup,
        heartbeat_interval: Duration,
        entry: &QueueEntry,
    ) -> JobResult<()> {
        let (job_id, argument) = payload::decode(&entry.args)?;
        let job = (lookup)(job_id).await?;

        let status = job.status().await.map_err(JobError::record)?;
        if status == JobStatus::Cancelled {
            tracing::info!(job_id, queue = %entry.queue_name, "Discarding cancelled job");
            store.expire(entry, EXPIRE_REASON_CANCELLED).await?;
            return Ok(());
        }
        if !status.is_runnable() {
            if let Err(e) = job.set_status(JobStatus::Killed).await {
                tracing::warn!(job_id, error = %e, "Failed to mark job killed");
            }
            return Err(JobError::InvalidState(status));
        }

        let task = definition.create_task(argument)?;

        job.set_status(JobStatus::Running)
            .await
            .map_err(JobError::record)?;

        let cancellation_token = CancellationToken::new();
        let ctx = JobContext {
            job_id,
            job_name: definition.name().to_string(),
            entry_id: entry.id,
            cancellation_token: cancellation_token.clone(),
        };
        let monitor = HeartbeatMonitor::spawn(
            Arc::clone(store),
            Arc::clone(&job),
            entry.clone(),
            heartbeat_interval,
            cancellation_token,
        );

        tracing::info!(job_id, queue = %entry.queue_name, "Job started");
        let outcome = AssertUnwindSafe(task.perform(ctx, Arc::clone(&job)))
            .catch_unwind()
            .await;
        let aborted = monitor.stop().await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic_payload) => {
                let message = panic_message(panic_payload.as_ref());
                let trace = std::backtrace::Backtrace::force_capture();
                if let Err(e) = job.append_log(&format!("panic: {message}\n{trace}")).await {
                    tracing::warn!(job_id, error = %e, "Failed to append panic log");
                }
                if let Err(e) = job.set_progress_text(&message).await {
                    tracing::warn!(job_id, error = %e, "Failed to record panic progress");
                }
                if let Err(e) = job.set_status(JobStatus::Exception).await {
                    tracing::warn!(job_id, error = %e, "Failed to mark job exception");
                }
                tracing::error!(job_id, queue = %entry.queue_name, %message, "Job handler panicked");
                std::panic::resume_unwind(panic_payload);
            }
        };

        if aborted {
            // The record already reads killed; the entry must never run
            // again, whatever the cancelled handler returned.
            store.expire(entry, EXPIRE_REASON_ABORTED).await?;
            return Err(JobError::Aborted);
        }

        match result {
            Ok(()) => {
                job.set_status(JobStatus::Done)
                    .await
                    .map_err(JobError::record)?;
                store.done(entry).await?;
                tracing::info!(job_id, queue = %entry.queue_name, "Job completed");
                Ok(())
            }
            Err(e) => {
                if let Err(pe) = job.set_progress_text(&e.to_string()).await {
                    tracing::warn!(job_id, error = %pe, "Failed to record error progress");
                }
                if let Err(se) = job.set_status(JobStatus::Exception).await {
                    tracing::warn!(job_id, error = %se, "Failed to mark job exception");
                }
                Err(e)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
