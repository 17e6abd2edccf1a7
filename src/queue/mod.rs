//! Durable job queue with rate-limited dispatch.
//!
//! This module provides the queue half of the job runtime:
//! - A [`Queue`] contract for enqueuing, killing, and removing jobs, and
//!   for starting the dispatch loops
//! - A [`QueueStore`] backend trait with PostgreSQL and in-memory
//!   implementations
//!
//! Every job type owns a queue named `worker_<job_name>`. Claims are
//! coordinated entirely by the store backend (row locks plus leases for
//! PostgreSQL), so any number of worker processes can poll the same
//! queue safely.
//!
//! # Configuration
//!
//! Configure the runtime in your TOML config file:
//!
//! ```toml
//! [queue]
//! heartbeat_interval_ms = 1000
//! lock_lease_secs = 30
//! retry_backoff_secs = 15
//!
//! [queue.default_limits]
//! max_lock_per_second = 10
//! max_buffer_jobs_count = 0
//! max_perform_per_second = 2
//! max_concurrent_perform_count = 1
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let store = Arc::new(PgQueueStore::new(pool, settings.queue.clone()));
//! let queue = JobQueue::new(store, settings.queue.clone());
//!
//! let mut registry = JobRegistry::new();
//! registry.register::<SendNewsletter>()?;
//!
//! queue.listen(registry, lookup).await?;
//! queue.add(job).await?;
//! ```

mod entry;
mod error;
mod manager;
mod memory;
mod postgres;
mod store;

pub use entry::QueueEntry;
pub use error::StoreError;
pub use manager::{JobQueue, QUEUE_NAME_PREFIX, Queue, queue_name};
pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;
pub use store::QueueStore;
