//! End-to-end tests for the job dispatch state machine.
//!
//! These run the real dispatch loops against the in-memory queue store
//! and a small in-memory job record store standing in for the embedding
//! application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::config::settings::QueueConfig;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::payload;
use crate::jobs::registry::{DispatchLimits, JobRegistry};
use crate::jobs::types::{HandleLookup, JobContext, JobHandle, JobId, JobStatus, JobTask};
use crate::queue::{JobQueue, MemoryQueueStore, Queue, QueueStore, queue_name};

// ============================================================================
// Test job record store (the embedding application's side)
// ============================================================================

#[derive(Debug, Clone)]
struct JobRecord {
    job_name: String,
    argument: JsonValue,
    status: JobStatus,
    progress_text: Option<String>,
    log: Vec<String>,
}

#[derive(Default)]
struct RecordStore {
    records: StdMutex<HashMap<JobId, JobRecord>>,
}

impl RecordStore {
    fn create(&self, id: JobId, job_name: &str, argument: JsonValue) {
        self.records.lock().unwrap().insert(
            id,
            JobRecord {
                job_name: job_name.to_string(),
                argument,
                status: JobStatus::New,
                progress_text: None,
                log: Vec::new(),
            },
        );
    }

    fn record(&self, id: JobId) -> Option<JobRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    fn status(&self, id: JobId) -> Option<JobStatus> {
        self.record(id).map(|record| record.status)
    }

    fn update(&self, id: JobId, apply: impl FnOnce(&mut JobRecord)) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("no job record {id}"))?;
        apply(record);
        Ok(())
    }

    fn handle(self: &Arc<Self>, id: JobId) -> anyhow::Result<Arc<dyn JobHandle>> {
        let record = self
            .record(id)
            .ok_or_else(|| anyhow::anyhow!("no job record {id}"))?;
        Ok(Arc::new(TestHandle {
            id,
            job_name: record.job_name,
            argument: record.argument,
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

struct TestHandle {
    id: JobId,
    job_name: String,
    argument: JsonValue,
    records: Arc<RecordStore>,
}

#[async_trait]
impl JobHandle for TestHandle {
    fn id(&self) -> JobId {
        self.id
    }

    fn job_name(&self) -> &str {
        &self.job_name
    }

    async fn status(&self) -> anyhow::Result<JobStatus> {
        self.records
            .status(self.id)
            .ok_or_else(|| anyhow::anyhow!("no job record {}", self.id))
    }

    async fn fetch_status(&self) -> anyhow::Result<JobStatus> {
        self.status().await
    }

    async fn set_status(&self, status: JobStatus) -> anyhow::Result<()> {
        self.records.update(self.id, |record| record.status = status)
    }

    async fn set_progress_text(&self, text: &str) -> anyhow::Result<()> {
        self.records
            .update(self.id, |record| record.progress_text = Some(text.to_string()))
    }

    async fn append_log(&self, line: &str) -> anyhow::Result<()> {
        self.records
            .update(self.id, |record| record.log.push(line.to_string()))
    }

    async fn argument(&self) -> anyhow::Result<JsonValue> {
        Ok(self.argument.clone())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    store: Arc<MemoryQueueStore>,
    records: Arc<RecordStore>,
    queue: Arc<JobQueue>,
}

impl Harness {
    fn new(config: QueueConfig) -> Self {
        let store = Arc::new(MemoryQueueStore::new(config.clone()));
        let records = Arc::new(RecordStore::default());
        let queue = Arc::new(JobQueue::new(store.clone(), config));
        Self {
            store,
            records,
            queue,
        }
    }

    async fn add_job(&self, id: JobId, job_name: &str, argument: JsonValue) -> Arc<dyn JobHandle> {
        self.records.create(id, job_name, argument);
        let handle = self.records.handle(id).unwrap();
        self.queue.add(Arc::clone(&handle)).await.unwrap();
        handle
    }

    async fn listen(&self, registry: JobRegistry) {
        self.queue
            .listen(registry, self.records.lookup())
            .await
            .unwrap();
    }
}

fn fast_limits() -> DispatchLimits {
    DispatchLimits {
        max_lock_per_second: 100,
        max_buffer_jobs_count: 0,
        max_perform_per_second: 100,
        max_concurrent_perform_count: 4,
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        heartbeat_interval_ms: 25,
        lock_lease_secs: 5,
        // High enough that a failed entry is not retried mid-test.
        retry_backoff_secs: 60,
        default_limits: fast_limits(),
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Task types under test
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProcessBatch {
    batch: usize,
}

#[async_trait]
impl JobTask for ProcessBatch {
    fn job_name() -> &'static str {
        "process_batch"
    }

    async fn perform(&self, _ctx: JobContext, job: Arc<dyn JobHandle>) -> JobResult<()> {
        job.set_progress_text(&format!("processed {}", self.batch))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SlowOk {}

#[async_trait]
impl JobTask for SlowOk {
    fn job_name() -> &'static str {
        "slow_ok"
    }

    async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FlakySend {}

#[async_trait]
impl JobTask for FlakySend {
    fn job_name() -> &'static str {
        "flaky_send"
    }

    async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
        Err(anyhow::anyhow!("smtp timeout").into())
    }
}

#[derive(Debug, Deserialize)]
struct MustNotRun {}

#[async_trait]
impl JobTask for MustNotRun {
    fn job_name() -> &'static str {
        "must_not_run"
    }

    async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
        panic!("this job must never be performed");
    }
}

#[derive(Debug, Deserialize)]
struct ScheduledPing {}

#[async_trait]
impl JobTask for ScheduledPing {
    fn job_name() -> &'static str {
        "scheduled_ping"
    }

    async fn perform(&self, _ctx: JobContext, job: Arc<dyn JobHandle>) -> JobResult<()> {
        job.set_progress_text("pinged").await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AwaitKill {}

#[async_trait]
impl JobTask for AwaitKill {
    fn job_name() -> &'static str {
        "await_kill"
    }

    async fn perform(&self, ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
        ctx.cancellation_token.cancelled().await;
        Err(anyhow::anyhow!("interrupted").into())
    }
}

#[derive(Debug, Deserialize)]
struct Explode {}

#[async_trait]
impl JobTask for Explode {
    fn job_name() -> &'static str {
        "explode"
    }

    async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
        panic!("boom");
    }
}

// ============================================================================
// Dispatch state machine
// ============================================================================

mod dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn test_job_runs_to_done() {
        let harness = Harness::new(fast_config());
        harness.add_job(1, "process_batch", json!({"batch": 3})).await;

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<ProcessBatch>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("job to complete", || {
            records.status(1) == Some(JobStatus::Done)
        })
        .await;

        let record = harness.records.record(1).unwrap();
        assert_eq!(record.progress_text.as_deref(), Some("processed 3"));

        let entries = harness.store.entries_for(&queue_name("process_batch")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].args, json!(["1", {"batch": 3}]));
        assert!(entries[0].done_at.is_some());
        assert!(entries[0].expired_at.is_none());

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_added_job_is_new_and_due_immediately() {
        let harness = Harness::new(fast_config());
        let before = chrono::Utc::now();
        harness.add_job(1, "process_batch", json!({"batch": 7})).await;
        let after = chrono::Utc::now();

        // No listener is running, so this is exactly the state `add` left.
        assert_eq!(harness.records.status(1), Some(JobStatus::New));

        let entries = harness.store.entries_for(&queue_name("process_batch")).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].run_at >= before && entries[0].run_at <= after);
        assert!(entries[0].locked_until.is_none());
        assert!(!entries[0].is_finalized());
    }

    #[tokio::test]
    async fn test_job_passes_through_running() {
        let harness = Harness::new(fast_config());
        harness.add_job(1, "slow_ok", json!({})).await;

        let mut registry = JobRegistry::new();
        registry.register_with_limits::<SlowOk>(fast_limits()).unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("job to start", || {
            records.status(1) == Some(JobStatus::Running)
        })
        .await;
        wait_until("job to complete", || {
            records.status(1) == Some(JobStatus::Done)
        })
        .await;

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_error_records_exception_and_schedules_retry() {
        let harness = Harness::new(fast_config());
        let added_at = chrono::Utc::now();
        harness.add_job(1, "flaky_send", json!({})).await;

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<FlakySend>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let store = Arc::clone(&harness.store);
        let queue = queue_name("flaky_send");
        wait_until("failure to be recorded", || {
            store.entries_for(&queue).unwrap()[0].error_count == 1
        })
        .await;

        let record = harness.records.record(1).unwrap();
        assert_eq!(record.status, JobStatus::Exception);
        assert_eq!(record.progress_text.as_deref(), Some("smtp timeout"));

        let entry = &harness.store.entries_for(&queue).unwrap()[0];
        assert_eq!(entry.last_error.as_deref(), Some("smtp timeout"));
        assert!(entry.done_at.is_none());
        assert!(entry.expired_at.is_none());
        assert!(entry.locked_until.is_none());
        assert!(entry.run_at > added_at);

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_job_is_discarded_unrun() {
        let harness = Harness::new(fast_config());
        let handle = harness.add_job(1, "must_not_run", json!({})).await;
        harness.queue.remove(handle).await.unwrap();

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<MustNotRun>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let store = Arc::clone(&harness.store);
        let queue = queue_name("must_not_run");
        wait_until("entry to be expired", || {
            store.entries_for(&queue).unwrap()[0].expired_at.is_some()
        })
        .await;

        let entry = &harness.store.entries_for(&queue).unwrap()[0];
        assert_eq!(entry.expire_reason.as_deref(), Some("job is cancelled"));

        let record = harness.records.record(1).unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.progress_text, None);
        assert!(record.log.is_empty());

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let harness = Harness::new(fast_config());
        let handle = harness.add_job(1, "must_not_run", json!({})).await;

        harness.queue.remove(Arc::clone(&handle)).await.unwrap();
        assert_eq!(harness.records.status(1), Some(JobStatus::Cancelled));

        // Removing an already-cancelled job is not an error.
        harness.queue.remove(handle).await.unwrap();
        assert_eq!(harness.records.status(1), Some(JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_unresolvable_job_is_failed_without_running() {
        let harness = Harness::new(fast_config());
        // Entry for job 99, which has no record behind the lookup.
        harness
            .store
            .enqueue(
                &queue_name("must_not_run"),
                payload::encode(99, &json!(null)),
                chrono::Utc::now(),
            )
            .await
            .unwrap();

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<MustNotRun>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let store = Arc::clone(&harness.store);
        let queue = queue_name("must_not_run");
        wait_until("lookup failure to be recorded", || {
            store.entries_for(&queue).unwrap()[0].error_count >= 1
        })
        .await;

        let entry = &harness.store.entries_for(&queue).unwrap()[0];
        assert!(
            entry
                .last_error
                .as_deref()
                .unwrap()
                .contains("job lookup failed for id 99")
        );
        assert!(entry.done_at.is_none());

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduled_job_waits_for_its_time() {
        let harness = Harness::new(fast_config());
        let at = chrono::Utc::now() + chrono::Duration::milliseconds(300);
        harness
            .add_job(1, "scheduled_ping", json!({"schedule_time": at.to_rfc3339()}))
            .await;

        assert_eq!(harness.records.status(1), Some(JobStatus::Scheduled));

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<ScheduledPing>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.records.status(1), Some(JobStatus::Scheduled));

        let records = Arc::clone(&harness.records);
        wait_until("scheduled job to complete", || {
            records.status(1) == Some(JobStatus::Done)
        })
        .await;

        let entry = &harness
            .store
            .entries_for(&queue_name("scheduled_ping"))
            .unwrap()[0];
        assert_eq!(entry.run_at, at);

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_already_terminal_is_marked_killed() {
        let harness = Harness::new(fast_config());
        harness.add_job(1, "process_batch", json!({"batch": 1})).await;
        harness
            .records
            .update(1, |record| record.status = JobStatus::Done)
            .unwrap();

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<ProcessBatch>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let store = Arc::clone(&harness.store);
        let queue = queue_name("process_batch");
        wait_until("invalid status to be recorded", || {
            store.entries_for(&queue).unwrap()[0].error_count >= 1
        })
        .await;

        assert_eq!(harness.records.status(1), Some(JobStatus::Killed));
        let entry = &harness.store.entries_for(&queue).unwrap()[0];
        assert!(
            entry
                .last_error
                .as_deref()
                .unwrap()
                .contains("invalid job status, current status: done")
        );

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_definitions_dispatch_independently() {
        let harness = Harness::new(fast_config());
        harness.add_job(1, "process_batch", json!({"batch": 9})).await;
        harness.add_job(2, "scheduled_ping", json!({})).await;

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<ProcessBatch>(fast_limits())
            .unwrap();
        registry
            .register_with_limits::<ScheduledPing>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("both jobs to complete", || {
            records.status(1) == Some(JobStatus::Done)
                && records.status(2) == Some(JobStatus::Done)
        })
        .await;

        assert_eq!(
            harness
                .store
                .entries_for(&queue_name("process_batch"))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            harness
                .store
                .entries_for(&queue_name("scheduled_ping"))
                .unwrap()
                .len(),
            1
        );

        harness.queue.shutdown().await;
    }
}

// ============================================================================
// Kill semantics
// ============================================================================

mod kill_tests {
    use super::*;

    #[tokio::test]
    async fn test_kill_running_job_cancels_and_keeps_killed_status() {
        let harness = Harness::new(fast_config());
        let handle = harness.add_job(1, "await_kill", json!({})).await;

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<AwaitKill>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("job to start", || {
            records.status(1) == Some(JobStatus::Running)
        })
        .await;

        harness.queue.kill(handle).await.unwrap();

        let store = Arc::clone(&harness.store);
        let queue = queue_name("await_kill");
        wait_until("entry to be expired", || {
            store.entries_for(&queue).unwrap()[0].expired_at.is_some()
        })
        .await;

        let entry = &harness.store.entries_for(&queue).unwrap()[0];
        assert_eq!(entry.expire_reason.as_deref(), Some("manually aborted"));
        assert!(entry.done_at.is_none());

        // The handler returned an error after cancellation, but the
        // record keeps its killed status and gains no exception text.
        let record = harness.records.record(1).unwrap();
        assert_eq!(record.status, JobStatus::Killed);
        assert_eq!(record.progress_text, None);

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_pending_job_never_starts() {
        let harness = Harness::new(fast_config());
        let handle = harness.add_job(1, "must_not_run", json!({})).await;
        harness.queue.kill(handle).await.unwrap();

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<MustNotRun>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let store = Arc::clone(&harness.store);
        let queue = queue_name("must_not_run");
        wait_until("invalid status to be recorded", || {
            store.entries_for(&queue).unwrap()[0].error_count >= 1
        })
        .await;

        assert_eq!(harness.records.status(1), Some(JobStatus::Killed));
        let entry = &harness.store.entries_for(&queue).unwrap()[0];
        assert!(
            entry
                .last_error
                .as_deref()
                .unwrap()
                .contains("invalid job status, current status: killed")
        );

        harness.queue.shutdown().await;
    }
}

// ============================================================================
// Panic policy
// ============================================================================

mod panic_tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_is_recorded_and_resurfaces_on_shutdown() {
        let harness = Harness::new(fast_config());
        harness.add_job(1, "explode", json!({})).await;

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<Explode>(fast_limits())
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("panic to be recorded", || {
            records.status(1) == Some(JobStatus::Exception)
        })
        .await;

        let record = harness.records.record(1).unwrap();
        assert_eq!(record.progress_text.as_deref(), Some("boom"));
        assert!(record.log.iter().any(|line| line.contains("panic: boom")));

        // The entry is left claimed, not finalized: the lease will lapse
        // and another worker may retry it.
        let entry = &harness.store.entries_for(&queue_name("explode")).unwrap()[0];
        assert!(entry.done_at.is_none());
        assert!(entry.expired_at.is_none());

        let queue = Arc::clone(&harness.queue);
        let shutdown = tokio::spawn(async move { queue.shutdown().await }).await;
        assert!(shutdown.unwrap_err().is_panic());
    }
}

// ============================================================================
// Dispatch limits
// ============================================================================

mod limit_tests {
    use super::*;

    static GATED_RUNNING: AtomicUsize = AtomicUsize::new(0);
    static GATED_PEAK: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Deserialize)]
    struct Gated {}

    #[async_trait]
    impl JobTask for Gated {
        fn job_name() -> &'static str {
            "gated"
        }

        async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
            let now = GATED_RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
            GATED_PEAK.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            GATED_RUNNING.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let harness = Harness::new(fast_config());
        for id in 1..=6 {
            harness.add_job(id, "gated", json!({})).await;
        }

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<Gated>(DispatchLimits {
                max_lock_per_second: 100,
                max_buffer_jobs_count: 2,
                max_perform_per_second: 100,
                max_concurrent_perform_count: 2,
            })
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("all jobs to complete", || {
            (1..=6).all(|id| records.status(id) == Some(JobStatus::Done))
        })
        .await;

        assert_eq!(GATED_PEAK.load(Ordering::SeqCst), 2);

        harness.queue.shutdown().await;
    }

    static POOLED_RUNNING: AtomicUsize = AtomicUsize::new(0);
    static POOLED_PEAK: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Deserialize)]
    struct Pooled {}

    #[async_trait]
    impl JobTask for Pooled {
        fn job_name() -> &'static str {
            "pooled"
        }

        async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
            let now = POOLED_RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
            POOLED_PEAK.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            POOLED_RUNNING.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_plain_registration_runs_under_configured_limits() {
        let mut config = fast_config();
        config.default_limits = DispatchLimits {
            max_lock_per_second: 100,
            max_buffer_jobs_count: 2,
            max_perform_per_second: 100,
            max_concurrent_perform_count: 3,
        };
        let harness = Harness::new(config);
        for id in 1..=6 {
            harness.add_job(id, "pooled", json!({})).await;
        }

        // No limits at registration, so `queue.default_limits` governs.
        let mut registry = JobRegistry::new();
        registry.register::<Pooled>().unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("all jobs to complete", || {
            (1..=6).all(|id| records.status(id) == Some(JobStatus::Done))
        })
        .await;

        assert_eq!(POOLED_PEAK.load(Ordering::SeqCst), 3);

        harness.queue.shutdown().await;
    }

    static METERED_STARTS: StdMutex<Vec<tokio::time::Instant>> = StdMutex::new(Vec::new());

    #[derive(Debug, Deserialize)]
    struct Metered {}

    #[async_trait]
    impl JobTask for Metered {
        fn job_name() -> &'static str {
            "metered"
        }

        async fn perform(&self, _ctx: JobContext, _job: Arc<dyn JobHandle>) -> JobResult<()> {
            METERED_STARTS.lock().unwrap().push(tokio::time::Instant::now());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_perform_rate_spaces_starts() {
        let harness = Harness::new(fast_config());
        for id in 1..=3 {
            harness.add_job(id, "metered", json!({})).await;
        }

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<Metered>(DispatchLimits {
                max_lock_per_second: 100,
                max_buffer_jobs_count: 4,
                max_perform_per_second: 5,
                max_concurrent_perform_count: 4,
            })
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("all jobs to complete", || {
            (1..=3).all(|id| records.status(id) == Some(JobStatus::Done))
        })
        .await;

        let starts = METERED_STARTS.lock().unwrap();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            // 5 per second means starts at least ~200ms apart; allow
            // generous timer slack.
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        drop(starts);

        harness.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_buffer_holds_no_extra_claims() {
        let harness = Harness::new(fast_config());
        for id in 1..=3 {
            harness.add_job(id, "slow_ok", json!({})).await;
        }

        let mut registry = JobRegistry::new();
        registry
            .register_with_limits::<SlowOk>(DispatchLimits {
                max_lock_per_second: 100,
                max_buffer_jobs_count: 0,
                max_perform_per_second: 100,
                max_concurrent_perform_count: 1,
            })
            .unwrap();
        harness.listen(registry).await;

        let records = Arc::clone(&harness.records);
        wait_until("first job to start", || {
            (1..=3).any(|id| records.status(id) == Some(JobStatus::Running))
        })
        .await;

        // With no buffer and one worker slot, only the running job's
        // entry may hold a live claim lease.
        let claimed = harness
            .store
            .entries_for(&queue_name("slow_ok"))
            .unwrap()
            .iter()
            .filter(|entry| entry.locked_until.is_some() && !entry.is_finalized())
            .count();
        assert_eq!(claimed, 1);

        wait_until("all jobs to complete", || {
            (1..=3).all(|id| records.status(id) == Some(JobStatus::Done))
        })
        .await;

        harness.queue.shutdown().await;
    }
}
