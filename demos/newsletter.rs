//! Minimal end-to-end worker: an in-memory record store standing in for
//! the embedding application, one job type, and a kill issued mid-run.
//!
//! Run with `cargo run --example newsletter`. Production setups swap
//! `MemoryQueueStore` for `PgQueueStore` over a diesel-async pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use quern_rs::config::QueueConfig;
use quern_rs::{
    DispatchLimits, HandleLookup, JobContext, JobError, JobHandle, JobId, JobQueue, JobRegistry,
    JobResult, JobStatus, JobTask, MemoryQueueStore, Queue,
};

#[derive(Debug, Clone)]
struct Record {
    argument: JsonValue,
    status: JobStatus,
    progress: Option<String>,
}

#[derive(Default)]
struct Records(Mutex<HashMap<JobId, Record>>);

impl Records {
    fn create(&self, id: JobId, argument: JsonValue) {
        self.0.lock().unwrap().insert(
            id,
            Record {
                argument,
                status: JobStatus::New,
                progress: None,
            },
        );
    }

    fn get(&self, id: JobId) -> anyhow::Result<Record> {
        self.0
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no job record {id}"))
    }

    fn handle(self: &Arc<Self>, id: JobId) -> anyhow::Result<Arc<dyn JobHandle>> {
        self.get(id)?;
        Ok(Arc::new(Handle {
            id,
            records: Arc::clone(self),
        }))
    }

    fn lookup(self: &Arc<Self>) -> HandleLookup {
        let records = Arc::clone(self);
        Arc::new(move |id| {
            let records = Arc::clone(&records);
            let fut: BoxFuture<'static, JobResult<Arc<dyn JobHandle>>> = Box::pin(async move {
                records
                    .handle(id)
                    .map_err(|e| JobError::Lookup { id, source: e })
            });
            fut
        })
    }
}

struct Handle {
    id: JobId,
    records: Arc<Records>,
}

#[async_trait]
impl JobHandle for Handle {
    fn id(&self) -> JobId {
        self.id
    }

    fn job_name(&self) -> &str {
        "send_newsletter"
    }

    async fn status(&self) -> anyhow::Result<JobStatus> {
        Ok(self.records.get(self.id)?.status)
    }

    async fn fetch_status(&self) -> anyhow::Result<JobStatus> {
        self.status().await
    }

    async fn set_status(&self, status: JobStatus) -> anyhow::Result<()> {
        let mut records = self.records.0.lock().unwrap();
        records
            .get_mut(&self.id)
            .ok_or_else(|| anyhow::anyhow!("no job record {}", self.id))?
            .status = status;
        Ok(())
    }

    async fn set_progress_text(&self, text: &str) -> anyhow::Result<()> {
        let mut records = self.records.0.lock().unwrap();
        records
            .get_mut(&self.id)
            .ok_or_else(|| anyhow::anyhow!("no job record {}", self.id))?
            .progress = Some(text.to_string());
        Ok(())
    }

    async fn append_log(&self, line: &str) -> anyhow::Result<()> {
        tracing::info!(job_id = self.id, "{line}");
        Ok(())
    }

    async fn argument(&self) -> anyhow::Result<JsonValue> {
        Ok(self.records.get(self.id)?.argument)
    }
}

#[derive(Debug, Deserialize)]
struct SendNewsletter {
    subject: String,
    recipients: usize,
}

#[async_trait]
impl JobTask for SendNewsletter {
    fn job_name() -> &'static str {
        "send_newsletter"
    }

    async fn perform(&self, ctx: JobContext, job: Arc<dyn JobHandle>) -> JobResult<()> {
        for sent in 1..=self.recipients {
            if ctx.cancellation_token.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            job.set_progress_text(&format!("{sent}/{} '{}'", self.recipients, self.subject))
                .await?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = QueueConfig {
        heartbeat_interval_ms: 250,
        ..Default::default()
    };
    let records = Arc::new(Records::default());
    let queue = JobQueue::new(Arc::new(MemoryQueueStore::new(config.clone())), config);

    let mut registry = JobRegistry::new();
    registry.register_with_limits::<SendNewsletter>(DispatchLimits {
        max_lock_per_second: 20,
        max_buffer_jobs_count: 0,
        max_perform_per_second: 10,
        max_concurrent_perform_count: 2,
    })?;
    queue.listen(registry, records.lookup()).await?;

    records.create(1, json!({"subject": "March issue", "recipients": 5}));
    records.create(2, json!({"subject": "Spam blast", "recipients": 100}));
    queue.add(records.handle(1)?).await?;
    queue.add(records.handle(2)?).await?;

    // Let both get going, then kill the long one mid-run.
    tokio::time::sleep(Duration::from_millis(700)).await;
    queue.kill(records.handle(2)?).await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    queue.shutdown().await;

    for id in [1, 2] {
        let record = records.get(id)?;
        tracing::info!(
            job_id = id,
            status = %record.status,
            progress = record.progress.as_deref().unwrap_or("-"),
            "Final state"
        );
    }
    Ok(())
}
