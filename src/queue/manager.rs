//! The job queue facade: enqueue, kill, remove, and listen.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::settings::QueueConfig;
use crate::jobs::dispatcher::DispatchLoop;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::payload;
use crate::jobs::registry::JobRegistry;
use crate::jobs::types::{HandleLookup, JobHandle, JobStatus};
use crate::queue::store::QueueStore;

/// Prefix applied to every job's durable queue name.
pub const QUEUE_NAME_PREFIX: &str = "worker_";

/// Durable queue name for a job type.
pub fn queue_name(job_name: &str) -> String {
    format!("{QUEUE_NAME_PREFIX}{job_name}")
}

/// The queue contract the embedding application talks to.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Persists an invocation of the job on its durable queue. Jobs whose
    /// argument declares a future `schedule_time` are marked `scheduled`
    /// and stay dormant until then.
    async fn add(&self, job: Arc<dyn JobHandle>) -> JobResult<()>;

    /// Requests that the job stop: running instances are cancelled as
    /// soon as the next heartbeat notices, pending ones never start.
    async fn kill(&self, job: Arc<dyn JobHandle>) -> JobResult<()>;

    /// Marks the job cancelled so its queue entry is discarded unrun.
    async fn remove(&self, job: Arc<dyn JobHandle>) -> JobResult<()>;

    /// Starts one dispatch loop per registered definition. Returns once
    /// the loops are running; they keep polling until `shutdown`.
    async fn listen(&self, registry: JobRegistry, lookup: HandleLookup) -> JobResult<()>;
}

/// Durable job queue runtime over a [`QueueStore`] backend.
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    stop: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            stop: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Stops all dispatch loops and waits for in-flight handlers.
    ///
    /// A handler panic that took a loop down resurfaces here, so process
    /// supervisors observe it instead of a silent hang.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().await;
            loops.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
                tracing::error!(error = %err, "Dispatch loop task aborted");
            }
        }
        tracing::info!("Job queue shut down");
    }
}

#[async_trait]
impl Queue for JobQueue {
    async fn add(&self, job: Arc<dyn JobHandle>) -> JobResult<()> {
        let argument = job.argument().await.map_err(JobError::record)?;

        let mut run_at = Utc::now();
        if let Some(at) = payload::scheduled_run_at(&argument) {
            if at > run_at {
                job.set_status(JobStatus::Scheduled)
                    .await
                    .map_err(JobError::record)?;
            }
            run_at = at;
        }

        let encoded = payload::encode(job.id(), &argument);
        let entry = self
            .store
            .enqueue(&queue_name(job.job_name()), encoded, run_at)
            .await?;
        tracing::info!(
            job_id = job.id(),
            job_name = %job.job_name(),
            entry_id = entry.id,
            "Job enqueued"
        );
        Ok(())
    }

    async fn kill(&self, job: Arc<dyn JobHandle>) -> JobResult<()> {
        job.set_status(JobStatus::Killed)
            .await
            .map_err(JobError::record)?;
        tracing::warn!(job_id = job.id(), job_name = %job.job_name(), "Job kill requested");
        Ok(())
    }

    async fn remove(&self, job: Arc<dyn JobHandle>) -> JobResult<()> {
        job.set_status(JobStatus::Cancelled)
            .await
            .map_err(JobError::record)?;
        tracing::info!(job_id = job.id(), job_name = %job.job_name(), "Job removed");
        Ok(())
    }

    async fn listen(&self, registry: JobRegistry, lookup: HandleLookup) -> JobResult<()> {
        if registry.is_empty() {
            return Err(JobError::NoDefinitions);
        }

        // Resolve every definition's limits up front; an invalid set
        // spawns no loops.
        let mut definitions = Vec::new();
        for definition in registry.into_definitions() {
            let limits = definition.limits_or(self.config.default_limits);
            limits.validate()?;
            definitions.push((definition, limits));
        }

        let mut loops = self.loops.lock().await;
        for (definition, limits) in definitions {
            let dispatch = DispatchLoop::new(
                Arc::clone(&self.store),
                definition,
                limits,
                Arc::clone(&lookup),
                self.config.heartbeat_interval(),
                self.stop.clone(),
            );
            loops.push(tokio::spawn(dispatch.run()));
        }
        tracing::info!(loop_count = loops.len(), "Job queue listening");
        Ok(())
    }
}
