//! Quern-RS Library
//!
//! Durable, rate-limited, cancellable background-job runtime backed by a
//! lock-capable persistent store.
//!
//! Jobs are submitted through the [`Queue`] facade, persisted as lockable
//! queue entries, and executed by per-definition dispatch loops under
//! throughput and concurrency limits. A per-job heartbeat detects kill
//! requests issued from other processes and cancels the handler
//! cooperatively.

pub mod config;
pub mod db;
pub mod jobs;
pub mod queue;
pub mod schema;

pub use jobs::{
    DispatchLimits, HandleLookup, JobContext, JobError, JobHandle, JobId, JobRegistry, JobResult,
    JobStatus, JobTask,
};
pub use queue::{
    JobQueue, MemoryQueueStore, PgQueueStore, Queue, QueueEntry, QueueStore, StoreError,
    queue_name,
};
