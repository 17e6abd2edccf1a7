use thiserror::Error;

use crate::config::ConfigError;
use crate::jobs::types::{JobId, JobStatus};
use crate::queue::StoreError;

/// Errors produced while enqueuing, dispatching, or performing jobs.
#[derive(Debug, Error)]
pub enum JobError {
    /// The durable queue store rejected or failed an operation.
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),

    /// A claimed job was not in a runnable state when the worker picked it up.
    #[error("invalid job status, current status: {0}")]
    InvalidState(JobStatus),

    /// The job handler itself returned an error. Transparent so the
    /// handler's own message becomes the recorded progress text.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),

    /// The job was killed while it was running.
    #[error("job manually aborted")]
    Aborted,

    /// The queue payload could not be decoded into a job invocation.
    #[error("malformed job payload: {0}")]
    Payload(String),

    /// A persisted status string did not name any known status.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// A payload referenced a job name with no registered definition.
    #[error("no job definition registered for '{0}'")]
    UnknownJob(String),

    /// Two definitions were registered under the same job name.
    #[error("job definition '{0}' is already registered")]
    DuplicateDefinition(String),

    /// `listen` was called with an empty registry.
    #[error("job registry is empty")]
    NoDefinitions,

    /// The embedding application failed to resolve a job record.
    #[error("job lookup failed for id {id}")]
    Lookup {
        id: JobId,
        #[source]
        source: anyhow::Error,
    },

    /// The embedding application failed to persist a status, progress,
    /// or log update on a job record.
    #[error("job record update failed")]
    Record {
        #[source]
        source: anyhow::Error,
    },

    /// A dispatch limit or queue setting failed validation.
    #[error("invalid dispatch configuration")]
    Config(#[from] ConfigError),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    /// Wraps a job-record persistence failure reported by the embedder.
    pub(crate) fn record(source: anyhow::Error) -> Self {
        Self::Record { source }
    }
}
