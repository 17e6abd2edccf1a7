//! Kill detection for running jobs.
//!
//! While a handler runs, a monitor task re-reads the persisted job status
//! on a fixed cadence. Seeing `killed` trips the handler's cancellation
//! token and flags the run as aborted; every other tick renews the claim
//! lease so the entry stays owned while work is still in progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::jobs::types::{JobHandle, JobStatus};
use crate::queue::{QueueEntry, QueueStore};

pub(crate) struct HeartbeatMonitor {
    aborted: Arc<AtomicBool>,
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub(crate) fn spawn(
        store: Arc<dyn QueueStore>,
        job: Arc<dyn JobHandle>,
        entry: QueueEntry,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        let aborted = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        let task = tokio::spawn(Self::run(
            store,
            job,
            entry,
            interval,
            cancellation_token,
            aborted.clone(),
            done.clone(),
        ));
        Self {
            aborted,
            done,
            task,
        }
    }

    async fn run(
        store: Arc<dyn QueueStore>,
        job: Arc<dyn JobHandle>,
        entry: QueueEntry,
        interval: Duration,
        cancellation_token: CancellationToken,
        aborted: Arc<AtomicBool>,
        done: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = tick.tick() => {
                    match job.fetch_status().await {
                        Ok(JobStatus::Killed) => {
                            aborted.store(true, Ordering::SeqCst);
                            cancellation_token.cancel();
                            tracing::warn!(
                                job_id = job.id(),
                                job_name = %job.job_name(),
                                "Kill requested, cancelling running job"
                            );
                            break;
                        }
                        Ok(_) => {
                            if let Err(e) = store.extend(&entry).await {
                                tracing::warn!(
                                    entry_id = entry.id,
                                    error = %e,
                                    "Failed to renew claim lease"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                job_id = job.id(),
                                error = %e,
                                "Failed to fetch persisted job status"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Stops the monitor and reports whether it observed a kill.
    ///
    /// The flag is only read after the monitor task has fully stopped, so
    /// the two finishing paths cannot race on it.
    pub(crate) async fn stop(self) -> bool {
        self.done.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Heartbeat monitor task failed");
        }
        self.aborted.load(Ordering::SeqCst)
    }
}
