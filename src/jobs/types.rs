use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::jobs::error::{JobError, JobResult};

/// Identifier of a job record in the embedding application.
///
/// Queue payloads carry it as a decimal string; the embedder resolves it
/// back to a live record through the [`HandleLookup`] given to `listen`.
pub type JobId = u64;

/// Lifecycle status of a job record.
///
/// The lowercase string form is the persisted representation; it must
/// survive round-trips through the embedder's storage unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Scheduled,
    Running,
    Done,
    Exception,
    Killed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Exception => "exception",
            JobStatus::Killed => "killed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are never left by normal dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Exception | JobStatus::Killed | JobStatus::Cancelled
        )
    }

    /// Only jobs waiting in `new` or `scheduled` may transition to `running`.
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobStatus::New | JobStatus::Scheduled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "exception" => Ok(JobStatus::Exception),
            "killed" => Ok(JobStatus::Killed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(JobError::UnknownStatus(other.to_string())),
        }
    }
}

/// Execution context passed to tasks.
///
/// The cancellation token trips when the job is killed out-of-band;
/// cooperative handlers should check it at convenient points.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    pub entry_id: i64,
    pub cancellation_token: CancellationToken,
}

/// Trait that all job tasks must implement.
///
/// The implementing struct is the typed argument payload: it is
/// deserialized from the queue entry before `perform` runs.
#[async_trait]
pub trait JobTask: Send + Sync + std::fmt::Debug {
    /// Unique name for this job type, used both for registry lookup and
    /// as the suffix of the durable queue name.
    fn job_name() -> &'static str
    where
        Self: Sized;

    /// Execute the task against its job record.
    async fn perform(&self, ctx: JobContext, job: Arc<dyn JobHandle>) -> JobResult<()>;

    /// Optional description
    fn description(&self) -> Option<String> {
        None
    }
}

/// Live view of a job record owned by the embedding application.
///
/// The worker drives all status transitions through this trait and never
/// touches the embedder's storage directly. `status` may serve a cached
/// value; `fetch_status` must re-read the persisted record, since the
/// kill path depends on observing out-of-band writes.
#[async_trait]
pub trait JobHandle: Send + Sync {
    fn id(&self) -> JobId;

    fn job_name(&self) -> &str;

    /// Current status, possibly from an in-memory copy of the record.
    async fn status(&self) -> anyhow::Result<JobStatus>;

    /// Re-reads the persisted status, bypassing any cached copy.
    async fn fetch_status(&self) -> anyhow::Result<JobStatus>;

    async fn set_status(&self, status: JobStatus) -> anyhow::Result<()>;

    /// Records free-form progress text, shown alongside the status.
    async fn set_progress_text(&self, text: &str) -> anyhow::Result<()>;

    /// Appends one line to the job's execution log.
    async fn append_log(&self, line: &str) -> anyhow::Result<()>;

    /// The argument payload this job was created with.
    async fn argument(&self) -> anyhow::Result<JsonValue>;
}

/// Resolves a job id from a queue payload back to a live [`JobHandle`].
///
/// Supplied by the embedding application when calling `listen`. A failed
/// resolution (see [`JobError::Lookup`]) fails the queue entry without
/// running any handler.
pub type HandleLookup =
    Arc<dyn Fn(JobId) -> BoxFuture<'static, JobResult<Arc<dyn JobHandle>>> + Send + Sync>;
