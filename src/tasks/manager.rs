//! Task lifecycle management.
//!
//! Owns the async-job state machine: creation, priority dispatch through a
//! worker pool, cooperative cancellation, per-capability timeouts, and the
//! TTL sweep. State transitions for a single task are serialized through the
//! store's entry lock; reads proceed concurrently and observe either the
//! pre- or post-mutation record, never a torn one.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{CapabilityError, ErrorCode, TaskAccessError, TaskError};
use crate::metrics::{
    MetricsSink, INVOCATIONS_TOTAL, INVOCATION_SECONDS, QUEUE_DEPTH, TASKS_CANCELLED_TOTAL,
    TASKS_CREATED_TOTAL, TASKS_FINISHED_TOTAL, TASK_SECONDS, TIMEOUTS_TOTAL,
};
use crate::registry::{CancelFlag, CapabilityRegistry, InvocationContext};

use super::store::TaskStore;
use super::task::{TaskPriority, TaskRecord, TaskStatus};

// ---------------------------------------------------------------------------
// Dispatch queue
// ---------------------------------------------------------------------------

/// Queue entry: higher priority first, FIFO within equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedTask {
    priority: TaskPriority,
    seq: u64,
    task_id: Uuid,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Cancellation outcome
// ---------------------------------------------------------------------------

/// Result of a cancellation request.
///
/// Requesting cancellation of a finished task is a no-op by design, not a
/// failure; the caller gets the terminal status back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag is set; the worker will observe it at its next checkpoint.
    Requested { status: TaskStatus },
    /// The task already reached a terminal state; nothing was mutated.
    AlreadyTerminal { status: TaskStatus },
}

// ---------------------------------------------------------------------------
// TaskManager
// ---------------------------------------------------------------------------

/// Owner of the async-task lifecycle.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<CapabilityRegistry>,
    metrics: Arc<MetricsSink>,
    default_timeout: Duration,
    task_ttl: Duration,
    cancel_flags: DashMap<Uuid, CancelFlag>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    queue_signal: Notify,
    shutdown_signal: Notify,
    shutdown: CancelFlag,
    seq: AtomicU64,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("default_timeout", &self.default_timeout)
            .field("task_ttl", &self.task_ttl)
            .field("queued", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<CapabilityRegistry>,
        metrics: Arc<MetricsSink>,
        default_timeout: Duration,
        task_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            default_timeout,
            task_ttl,
            cancel_flags: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            queue_signal: Notify::new(),
            shutdown_signal: Notify::new(),
            shutdown: CancelFlag::new(),
            seq: AtomicU64::new(0),
        }
    }

    // ---- Creation and dispatch ----

    /// Allocate a `PENDING` task and return its id immediately.
    pub fn create(
        &self,
        tool: impl Into<String>,
        payload: Value,
        owner_id: impl Into<String>,
        priority: TaskPriority,
    ) -> Uuid {
        let record = TaskRecord::new(tool, payload, owner_id, priority);
        let id = record.id;
        let tool = record.tool.clone();
        self.cancel_flags.insert(id, CancelFlag::new());
        self.store.insert(record);
        self.metrics.incr(TASKS_CREATED_TOTAL, &[("tool", &tool)]);
        tracing::debug!(task_id = %id, tool = %tool, "task created");
        id
    }

    /// Create a task and hand it to the worker pool.
    pub fn submit(
        &self,
        tool: impl Into<String>,
        payload: Value,
        owner_id: impl Into<String>,
        priority: TaskPriority,
    ) -> Uuid {
        let id = self.create(tool, payload, owner_id, priority);
        self.enqueue(id, priority);
        id
    }

    fn enqueue(&self, task_id: Uuid, priority: TaskPriority) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push(QueuedTask {
            priority,
            seq,
            task_id,
        });
        self.metrics
            .gauge_add(QUEUE_DEPTH, &[("priority", priority.as_str())], 1);
        self.queue_signal.notify_one();
    }

    fn pop_next(&self) -> Option<QueuedTask> {
        self.queue.lock().pop()
    }

    // ---- Reads ----

    /// Fetch a task on behalf of `requester_id`.
    ///
    /// An id owned by someone else fails with `Forbidden`; `NotFound` is
    /// reserved for ids that genuinely do not exist.
    pub fn get(&self, task_id: &Uuid, requester_id: &str) -> Result<TaskRecord, TaskAccessError> {
        let record = self.store.get(task_id).ok_or(TaskAccessError::NotFound)?;
        if record.owner_id != requester_id {
            return Err(TaskAccessError::Forbidden);
        }
        Ok(record)
    }

    /// List the requester's tasks, optionally filtered, oldest first.
    pub fn list(
        &self,
        requester_id: &str,
        status_filter: Option<TaskStatus>,
        tool_filter: Option<&str>,
    ) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self
            .store
            .all()
            .into_iter()
            .filter(|record| record.owner_id == requester_id)
            .filter(|record| status_filter.map_or(true, |status| record.status == status))
            .filter(|record| tool_filter.map_or(true, |tool| record.tool == tool))
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    // ---- Cancellation ----

    /// Set the cancellation flag for an owned task. Idempotent, never errors
    /// for the owner; terminal tasks report their state without mutation.
    pub fn request_cancellation(
        &self,
        task_id: &Uuid,
        requester_id: &str,
    ) -> Result<CancelOutcome, TaskAccessError> {
        let record = self.get(task_id, requester_id)?;
        if record.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal {
                status: record.status,
            });
        }
        if let Some(flag) = self.cancel_flags.get(task_id) {
            flag.request();
        }
        self.store
            .update(task_id, &mut |r| r.cancellation_requested = true);
        tracing::debug!(task_id = %task_id, "cancellation requested");
        Ok(CancelOutcome::Requested {
            status: record.status,
        })
    }

    /// Whether a cancellation request is pending for this task.
    pub fn is_cancellation_requested(&self, task_id: &Uuid) -> bool {
        self.cancel_flags
            .get(task_id)
            .map(|flag| flag.is_requested())
            .unwrap_or(false)
    }

    // ---- State transitions (invoked by the executing worker) ----

    /// `PENDING → RUNNING`. Guarded no-op for missing or non-pending tasks.
    pub fn mark_running(&self, task_id: &Uuid) {
        self.store.update(task_id, &mut |record| {
            if record.status == TaskStatus::Pending {
                record.status = TaskStatus::Running;
                record.started_at = Some(Utc::now());
            }
        });
    }

    /// Move to `COMPLETED` with a result.
    pub fn mark_completed(&self, task_id: &Uuid, result: Value) {
        self.finish(task_id, TaskStatus::Completed, Some(result), None);
    }

    /// Move to `FAILED` with a structured error.
    pub fn mark_failed(&self, task_id: &Uuid, error: TaskError) {
        self.finish(task_id, TaskStatus::Failed, None, Some(error));
    }

    /// Move to `CANCELLED`, discarding any produced result.
    pub fn mark_cancelled(&self, task_id: &Uuid) {
        if let Some(tool) = self.finish(task_id, TaskStatus::Cancelled, None, None) {
            self.metrics.incr(TASKS_CANCELLED_TOTAL, &[("tool", &tool)]);
        }
    }

    /// Apply a terminal transition. Returns the task's tool name when the
    /// transition actually happened; already-terminal tasks are untouched.
    fn finish(
        &self,
        task_id: &Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> Option<String> {
        let mut tool = None;
        let mut duration = None;
        self.store.update(task_id, &mut |record| {
            if record.is_terminal() {
                return;
            }
            record.status = status;
            record.progress = 1.0;
            record.result = result.clone();
            record.error = error.clone();
            let now = Utc::now();
            record.completed_at = Some(now);
            tool = Some(record.tool.clone());
            duration = (now - record.created_at).to_std().ok();
        });
        if let Some(tool) = &tool {
            self.metrics.incr(
                TASKS_FINISHED_TOTAL,
                &[("tool", tool), ("status", status.as_str())],
            );
            if let Some(duration) = duration {
                self.metrics
                    .observe_seconds(TASK_SECONDS, &[("tool", tool)], duration.as_secs_f64());
            }
        }
        tool
    }

    // ---- Background execution ----

    /// Run one task to a terminal state.
    ///
    /// Resolution failures become `FAILED`/`VALIDATION_ERROR`; capability
    /// errors and timeouts are captured on the record, so a task can never
    /// crash its worker loop. A cancellation observed before or after the
    /// invocation wins over a produced result.
    pub async fn execute(&self, task_id: Uuid) {
        let record = match self.store.get(&task_id) {
            Some(record) => record,
            None => return,
        };
        if record.is_terminal() {
            return;
        }
        let flag = self
            .cancel_flags
            .get(&task_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if flag.is_requested() {
            self.mark_cancelled(&task_id);
            return;
        }

        let owner_class = caller_class(&record.owner_id).to_string();
        let tool = record.tool.clone();
        let capability = match self.registry.load(&tool) {
            Some(capability) => capability,
            None => {
                self.mark_failed(
                    &task_id,
                    TaskError::new(
                        ErrorCode::ValidationError,
                        format!("capability '{}' could not be resolved", tool),
                    ),
                );
                self.record_invocation(&tool, "failed", &owner_class, None);
                return;
            }
        };

        self.mark_running(&task_id);
        let timeout = capability.timeout().unwrap_or(self.default_timeout);
        let ctx = self.invocation_context(task_id, flag.clone());
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, capability.invoke(record.payload, &ctx)).await;
        let elapsed = started.elapsed();

        match outcome {
            Err(_) => {
                self.metrics.incr(TIMEOUTS_TOTAL, &[("tool", &tool)]);
                self.mark_failed(
                    &task_id,
                    TaskError::new(
                        ErrorCode::Timeout,
                        format!("invocation exceeded {:?} deadline", timeout),
                    ),
                );
                self.record_invocation(&tool, "timeout", &owner_class, Some(elapsed));
            }
            Ok(Err(CapabilityError::Cancelled)) => {
                self.mark_cancelled(&task_id);
                self.record_invocation(&tool, "cancelled", &owner_class, Some(elapsed));
            }
            Ok(Err(err)) => {
                self.mark_failed(&task_id, err.into());
                self.record_invocation(&tool, "failed", &owner_class, Some(elapsed));
            }
            Ok(Ok(result)) => {
                // A cancellation observed late still wins; the result is
                // discarded rather than recorded.
                if flag.is_requested() {
                    self.mark_cancelled(&task_id);
                    self.record_invocation(&tool, "cancelled", &owner_class, Some(elapsed));
                } else {
                    self.mark_completed(&task_id, result);
                    self.record_invocation(&tool, "completed", &owner_class, Some(elapsed));
                }
            }
        }
    }

    fn invocation_context(&self, task_id: Uuid, flag: CancelFlag) -> InvocationContext {
        let store = Arc::clone(&self.store);
        InvocationContext::new(flag).with_progress(Arc::new(move |value: f64| {
            let clamped = value.clamp(0.0, 0.99);
            store.update(&task_id, &mut |record| {
                if record.status == TaskStatus::Running {
                    record.progress = clamped;
                }
            });
        }))
    }

    fn record_invocation(
        &self,
        tool: &str,
        outcome: &str,
        caller: &str,
        elapsed: Option<Duration>,
    ) {
        self.metrics.incr(
            INVOCATIONS_TOTAL,
            &[("tool", tool), ("outcome", outcome), ("caller", caller)],
        );
        if let Some(elapsed) = elapsed {
            self.metrics
                .observe_seconds(INVOCATION_SECONDS, &[("tool", tool)], elapsed.as_secs_f64());
        }
    }

    // ---- Worker pool ----

    /// Spawn `count` workers draining the queue by priority, FIFO within
    /// equal priority.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|index| {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    tracing::debug!(worker = index, "task worker started");
                    manager.worker_loop().await;
                    tracing::debug!(worker = index, "task worker stopped");
                })
            })
            .collect()
    }

    async fn worker_loop(&self) {
        loop {
            if self.shutdown.is_requested() {
                return;
            }
            while let Some(queued) = self.pop_next() {
                self.metrics.gauge_add(
                    QUEUE_DEPTH,
                    &[("priority", queued.priority.as_str())],
                    -1,
                );
                self.execute(queued.task_id).await;
                if self.shutdown.is_requested() {
                    return;
                }
            }
            // The timeout bounds the window between a missed wakeup (a push
            // or shutdown landing before this await registers) and the next
            // flag check.
            tokio::select! {
                _ = self.queue_signal.notified() => {}
                _ = self.shutdown_signal.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    /// Signal workers and the sweeper to stop after their current item.
    pub fn shutdown(&self) {
        self.shutdown.request();
        self.shutdown_signal.notify_waiters();
    }

    // ---- Expiry sweep ----

    /// Collect terminal tasks older than the TTL. Returns how many were
    /// removed. Non-terminal tasks are never collected regardless of age.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .store
            .all()
            .into_iter()
            .filter(|record| record.expired(self.task_ttl, now))
            .map(|record| record.id)
            .collect();
        let mut removed = 0;
        for id in &expired {
            if self.store.remove(id) {
                self.cancel_flags.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "expired tasks swept");
        }
        removed
    }

    /// Run the sweep on an interval until shutdown.
    pub fn run_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if manager.shutdown.is_requested() {
                            return;
                        }
                        manager.sweep_expired();
                    }
                    _ = manager.shutdown_signal.notified() => {
                        if manager.shutdown.is_requested() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Coarse caller classification for metric labels, derived from the leading
/// segment of the caller identity.
pub(crate) fn caller_class(owner_id: &str) -> &str {
    owner_id
        .split(['_', '-', ':'])
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::registry::Capability;
    use crate::tasks::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoCapability;

    #[async_trait]
    impl Capability for EchoCapability {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            payload: Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, CapabilityError> {
            Ok(payload)
        }
    }

    struct FailingCapability;

    #[async_trait]
    impl Capability for FailingCapability {
        fn name(&self) -> &str {
            "failing"
        }

        async fn invoke(
            &self,
            _payload: Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, CapabilityError> {
            Err(CapabilityError::Execution("backend unavailable".into()))
        }
    }

    struct SlowCapability;

    #[async_trait]
    impl Capability for SlowCapability {
        fn name(&self) -> &str {
            "slow"
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }

        async fn invoke(
            &self,
            _payload: Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("too late"))
        }
    }

    /// Blocks until released, then completes normally.
    struct GatedCapability {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Capability for GatedCapability {
        fn name(&self) -> &str {
            "gated"
        }

        async fn invoke(
            &self,
            _payload: Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, CapabilityError> {
            self.release.notified().await;
            Ok(json!("finished anyway"))
        }
    }

    fn manager_with(
        register: impl FnOnce(&CapabilityRegistry),
    ) -> (Arc<TaskManager>, Arc<MetricsSink>) {
        let registry = Arc::new(CapabilityRegistry::new());
        register(&registry);
        let metrics = Arc::new(MetricsSink::new());
        let manager = Arc::new(TaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            registry,
            Arc::clone(&metrics),
            Duration::from_secs(5),
            Duration::from_secs(3600),
        ));
        (manager, metrics)
    }

    fn register_echo(registry: &CapabilityRegistry) {
        registry.register(
            "echo",
            "returns its payload",
            Arc::new(|| Some(Arc::new(EchoCapability) as Arc<dyn Capability>)),
        );
    }

    #[test]
    fn test_cross_owner_isolation() {
        let (manager, _) = manager_with(register_echo);
        let id = manager.create("echo", json!({}), "user_1", TaskPriority::Normal);
        assert_eq!(
            manager.get(&id, "user_2").unwrap_err(),
            TaskAccessError::Forbidden
        );
        assert!(manager.get(&id, "user_1").is_ok());
        assert_eq!(
            manager.get(&Uuid::new_v4(), "user_1").unwrap_err(),
            TaskAccessError::NotFound
        );
    }

    #[test]
    fn test_request_cancellation_is_idempotent() {
        let (manager, _) = manager_with(register_echo);
        let id = manager.create("echo", json!({}), "user_1", TaskPriority::Normal);
        let first = manager.request_cancellation(&id, "user_1").unwrap();
        let second = manager.request_cancellation(&id, "user_1").unwrap();
        assert_eq!(first, second);
        assert!(manager.is_cancellation_requested(&id));
        // The flag does not itself change the status.
        assert_eq!(manager.get(&id, "user_1").unwrap().status, TaskStatus::Pending);
        assert!(manager.get(&id, "user_1").unwrap().cancellation_requested);
    }

    #[test]
    fn test_cancel_terminal_task_is_noop() {
        let (manager, _) = manager_with(register_echo);
        let id = manager.create("echo", json!({}), "user_1", TaskPriority::Normal);
        manager.mark_completed(&id, json!("done"));
        let outcome = manager.request_cancellation(&id, "user_1").unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::AlreadyTerminal {
                status: TaskStatus::Completed
            }
        );
        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(!record.cancellation_requested);
    }

    #[test]
    fn test_terminal_invariants() {
        let (manager, _) = manager_with(register_echo);
        let completed = manager.create("echo", json!({}), "u", TaskPriority::Normal);
        manager.mark_completed(&completed, json!(1));
        let record = manager.get(&completed, "u").unwrap();
        assert_eq!(record.progress, 1.0);
        assert!(record.result.is_some() && record.error.is_none());
        assert!(record.completed_at.is_some());

        let failed = manager.create("echo", json!({}), "u", TaskPriority::Normal);
        manager.mark_failed(&failed, TaskError::new(ErrorCode::ExecutionError, "boom"));
        let record = manager.get(&failed, "u").unwrap();
        assert_eq!(record.progress, 1.0);
        assert!(record.result.is_none() && record.error.is_some());

        // A second terminal transition is ignored.
        manager.mark_completed(&failed, json!("late"));
        let record = manager.get(&failed, "u").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn test_execute_success() {
        let (manager, metrics) = manager_with(register_echo);
        let id = manager.create("echo", json!({"q": 1}), "user_1", TaskPriority::Normal);
        manager.execute(id).await;
        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({"q": 1})));
        assert!(record.started_at.is_some());
        assert_eq!(
            metrics.counter_value(
                INVOCATIONS_TOTAL,
                &[("tool", "echo"), ("outcome", "completed"), ("caller", "user")],
            ),
            1
        );
        assert_eq!(metrics.histogram_count(INVOCATION_SECONDS, &[("tool", "echo")]), 1);
    }

    #[tokio::test]
    async fn test_execute_unresolvable_tool_fails_validation() {
        let (manager, _) = manager_with(|_| {});
        let id = manager.create("ghost", json!({}), "user_1", TaskPriority::Normal);
        manager.execute(id).await;
        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_execute_capability_failure_is_captured() {
        let (manager, _) = manager_with(|registry| {
            registry.register(
                "failing",
                "always fails",
                Arc::new(|| Some(Arc::new(FailingCapability) as Arc<dyn Capability>)),
            );
        });
        let id = manager.create("failing", json!({}), "user_1", TaskPriority::Normal);
        manager.execute(id).await;
        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecutionError);
        assert!(error.message.contains("backend unavailable"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let (manager, metrics) = manager_with(|registry| {
            registry.register(
                "slow",
                "sleeps past its deadline",
                Arc::new(|| Some(Arc::new(SlowCapability) as Arc<dyn Capability>)),
            );
        });
        let id = manager.create("slow", json!({}), "user_1", TaskPriority::Normal);
        manager.execute(id).await;
        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().code, ErrorCode::Timeout);
        assert_eq!(metrics.counter_value(TIMEOUTS_TOTAL, &[("tool", "slow")]), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_execute_wins() {
        let (manager, _) = manager_with(register_echo);
        let id = manager.create("echo", json!({}), "user_1", TaskPriority::Normal);
        manager.request_cancellation(&id, "user_1").unwrap();
        manager.execute(id).await;
        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.result.is_none());
        assert_eq!(record.progress, 1.0);
    }

    #[tokio::test]
    async fn test_cancellation_race_discards_result() {
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);
        let (manager, _) = manager_with(move |registry| {
            registry.register(
                "gated",
                "waits for release",
                Arc::new(move || {
                    Some(Arc::new(GatedCapability {
                        release: Arc::clone(&gate),
                    }) as Arc<dyn Capability>)
                }),
            );
        });

        let id = manager.create("gated", json!({}), "user_1", TaskPriority::Normal);
        let runner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.execute(id).await })
        };

        // Wait for the worker to reach RUNNING, cancel, then let the
        // capability finish normally.
        loop {
            if manager.get(&id, "user_1").unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        manager.request_cancellation(&id, "user_1").unwrap();
        release.notify_one();
        runner.await.unwrap();

        let record = manager.get(&id, "user_1").unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.result.is_none());
        assert_eq!(record.progress, 1.0);
    }

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let (manager, _) = manager_with(register_echo);
        let low = manager.submit("echo", json!({}), "u", TaskPriority::Low);
        let high_1 = manager.submit("echo", json!({}), "u", TaskPriority::High);
        let normal = manager.submit("echo", json!({}), "u", TaskPriority::Normal);
        let high_2 = manager.submit("echo", json!({}), "u", TaskPriority::High);

        let order: Vec<Uuid> = std::iter::from_fn(|| manager.pop_next())
            .map(|queued| queued.task_id)
            .collect();
        assert_eq!(order, vec![high_1, high_2, normal, low]);
    }

    #[test]
    fn test_queue_depth_gauge() {
        let (manager, metrics) = manager_with(register_echo);
        manager.submit("echo", json!({}), "u", TaskPriority::High);
        manager.submit("echo", json!({}), "u", TaskPriority::High);
        assert_eq!(metrics.gauge_value(QUEUE_DEPTH, &[("priority", "high")]), 2);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue() {
        let (manager, _) = manager_with(register_echo);
        let handles = manager.spawn_workers(2);
        let ids: Vec<Uuid> = (0..5)
            .map(|i| manager.submit("echo", json!({ "i": i }), "u", TaskPriority::Normal))
            .collect();

        for id in &ids {
            loop {
                if manager.get(id, "u").unwrap().is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            assert_eq!(manager.get(id, "u").unwrap().status, TaskStatus::Completed);
        }
        manager.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_sweep_collects_only_expired_terminal() {
        let (manager, _) = manager_with(register_echo);
        let old_done = manager.create("echo", json!({}), "u", TaskPriority::Normal);
        manager.mark_completed(&old_done, json!(1));
        let fresh_done = manager.create("echo", json!({}), "u", TaskPriority::Normal);
        manager.mark_completed(&fresh_done, json!(2));
        let old_pending = manager.create("echo", json!({}), "u", TaskPriority::Normal);

        // Age the first terminal task and the pending task past the TTL.
        let past = Utc::now() - chrono::Duration::hours(3);
        manager.store.update(&old_done, &mut |r| r.completed_at = Some(past));
        manager.store.update(&old_pending, &mut |r| r.created_at = past);

        assert_eq!(manager.sweep_expired(), 1);
        assert!(manager.get(&old_done, "u").is_err());
        assert!(manager.get(&fresh_done, "u").is_ok());
        assert!(manager.get(&old_pending, "u").is_ok());
    }

    #[test]
    fn test_list_filters() {
        let (manager, _) = manager_with(register_echo);
        let a = manager.create("echo", json!({}), "user_1", TaskPriority::Normal);
        let _b = manager.create("other", json!({}), "user_1", TaskPriority::Normal);
        let _c = manager.create("echo", json!({}), "user_2", TaskPriority::Normal);
        manager.mark_completed(&a, json!(1));

        assert_eq!(manager.list("user_1", None, None).len(), 2);
        assert_eq!(manager.list("user_1", Some(TaskStatus::Completed), None).len(), 1);
        assert_eq!(manager.list("user_1", None, Some("echo")).len(), 1);
        assert_eq!(manager.list("user_2", None, None).len(), 1);
        assert_eq!(manager.list("stranger", None, None).len(), 0);
    }

    #[test]
    fn test_caller_class() {
        assert_eq!(caller_class("user_1"), "user");
        assert_eq!(caller_class("service-billing"), "service");
        assert_eq!(caller_class("anonymous"), "anonymous");
    }

    #[tokio::test]
    async fn test_progress_reported_mid_run() {
        struct ProgressCapability;

        #[async_trait]
        impl Capability for ProgressCapability {
            fn name(&self) -> &str {
                "progress"
            }

            async fn invoke(
                &self,
                _payload: Value,
                ctx: &InvocationContext,
            ) -> Result<Value, CapabilityError> {
                ctx.report_progress(0.5);
                ctx.checkpoint()?;
                Ok(json!("ok"))
            }
        }

        let (manager, _) = manager_with(|registry| {
            registry.register(
                "progress",
                "reports progress",
                Arc::new(|| Some(Arc::new(ProgressCapability) as Arc<dyn Capability>)),
            );
        });
        let id = manager.create("progress", json!({}), "u", TaskPriority::Normal);
        manager.execute(id).await;
        let record = manager.get(&id, "u").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 1.0);
    }
}
