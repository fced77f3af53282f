use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use foreman_core::store::{StoreError, TaskStore};
use foreman_core::types::{SystemStats, Task, TaskPriority, TaskStatus};
use serde_json::json;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::progress::{ProgressChannel, ProgressError, ProgressUpdate};
use crate::runner::{AgentRunner, RunOutcome, RunResult};
use crate::vcs::Snapshotter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("task {0} is already terminal ({1})")]
    AlreadyTerminal(Uuid, TaskStatus),
    #[error("task {0} is {1}, only failed tasks can be retried")]
    NotFailed(Uuid, TaskStatus),
    #[error("retry attempt {attempt} exceeds limit {max}")]
    RetryLimitExceeded { attempt: u32, max: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Watch(#[from] ProgressError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Settings and inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Upper bound on simultaneously running tasks across all projects.
    pub max_concurrent: usize,
    /// Wall-clock budget per task, deferred handoffs included.
    pub task_timeout: Duration,
    /// Snapshot the project tree after each successful task.
    pub auto_snapshot: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            task_timeout: Duration::from_secs(300),
            auto_snapshot: true,
        }
    }
}

/// What a caller submits; everything else on [`Task`] is engine-owned.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub project_ref: String,
    pub description: String,
    pub instruction: String,
    pub priority: TaskPriority,
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(
        project_ref: impl Into<String>,
        description: impl Into<String>,
        instruction: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            project_ref: project_ref.into(),
            description: description.into(),
            instruction: instruction.into(),
            priority,
            context: serde_json::Map::new(),
        }
    }
}

/// Live dispatcher counters on top of the stored status counts.
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub system: SystemStats,
    pub running: usize,
    pub queued: usize,
}

// ---------------------------------------------------------------------------
// Queue ordering
// ---------------------------------------------------------------------------

/// Heap entry: priority descending, then creation time ascending, then
/// submission sequence ascending. `seq` is unique, so ordering is total.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedEntry {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Internal execution plumbing
// ---------------------------------------------------------------------------

/// A deferred task's final word, forwarded from the update router.
#[derive(Debug)]
struct Resolution {
    success: bool,
    result: Option<String>,
    error: Option<String>,
}

struct RunningHandle {
    cancel_tx: oneshot::Sender<()>,
}

enum Exec {
    Finished(RunResult),
    TimedOut,
    Cancelled,
    RunnerFailed(String),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns the global task queue and the concurrency gate.
///
/// One dispatch loop pulls submissions into a priority heap and spawns an
/// execution unit per task once a semaphore permit is free. A separate
/// router task is the only consumer of watcher updates; it forwards
/// resolutions to the execution unit waiting on them, so task state is only
/// ever mutated from the unit that owns the task.
pub struct Dispatcher {
    store: Arc<TaskStore>,
    runner: Arc<dyn AgentRunner>,
    progress: Arc<ProgressChannel>,
    snapshotter: Option<Arc<dyn Snapshotter>>,
    settings: DispatcherSettings,
    gate: Arc<Semaphore>,
    intake_tx: flume::Sender<QueuedEntry>,
    intake_rx: flume::Receiver<QueuedEntry>,
    updates_rx: flume::Receiver<ProgressUpdate>,
    running: Mutex<HashMap<Uuid, RunningHandle>>,
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<Resolution>>>,
    seq: AtomicU64,
    queued: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        runner: Arc<dyn AgentRunner>,
        progress: Arc<ProgressChannel>,
        snapshotter: Option<Arc<dyn Snapshotter>>,
        settings: DispatcherSettings,
        updates_rx: flume::Receiver<ProgressUpdate>,
    ) -> Arc<Self> {
        let (intake_tx, intake_rx) = flume::unbounded();
        Arc::new(Self {
            store,
            runner,
            progress,
            snapshotter,
            gate: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings,
            intake_tx,
            intake_rx,
            updates_rx,
            running: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
        })
    }

    /// Spawn the dispatch loop and the update router. Call once.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_loop().await });
        let this = Arc::clone(self);
        tokio::spawn(async move { this.update_router().await });
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Persist a fresh Pending task and enqueue it for dispatch.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task> {
        let mut task = Task::new(
            spec.project_ref,
            spec.description,
            spec.instruction,
            spec.priority,
        );
        task.context = spec.context;

        self.store.ensure_project(&task.project_ref).await?;
        self.store.save_task(&task).await?;
        self.store
            .append_activity(
                Some(&task.project_ref),
                Some(task.id),
                "task_submitted",
                Some(json!({
                    "description": task.description,
                    "priority": task.priority,
                })),
            )
            .await?;

        let entry = QueuedEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            task_id: task.id,
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.intake_tx.send_async(entry).await.is_err() {
            warn!(task_id = %task.id, "dispatch loop gone, task persisted but not enqueued");
        }
        info!(task_id = %task.id, project = %task.project_ref, priority = ?task.priority, "task submitted");
        Ok(task)
    }

    /// Instantiate a stored template and submit the result.
    pub async fn submit_from_template(
        &self,
        name: &str,
        project_ref: &str,
        values: &HashMap<String, String>,
    ) -> Result<Task> {
        let template = self
            .store
            .get_template(name)
            .await?
            .ok_or_else(|| DispatchError::TemplateNotFound(name.to_string()))?;
        let (description, instruction) = template.render(values);

        let mut spec = TaskSpec::new(
            project_ref,
            description,
            instruction,
            template.default_priority,
        );
        spec.context.insert("template".into(), json!(name));

        // Bump the counter only once the task actually exists.
        let task = self.submit(spec).await?;
        self.store.increment_template_use(name).await?;
        Ok(task)
    }

    /// Resubmit a failed task as a fresh one, recording lineage in the new
    /// task's context. The original row is never mutated.
    pub async fn retry(&self, task_id: Uuid, max_retries: u32) -> Result<Task> {
        let original = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(DispatchError::NotFound(task_id))?;
        if original.status != TaskStatus::Failed {
            return Err(DispatchError::NotFailed(task_id, original.status));
        }

        let attempt = original.retry_attempt() + 1;
        if attempt > max_retries {
            return Err(DispatchError::RetryLimitExceeded {
                attempt,
                max: max_retries,
            });
        }

        let mut spec = TaskSpec::new(
            original.project_ref.clone(),
            original.description.clone(),
            original.instruction.clone(),
            original.priority,
        );
        spec.context = original.context.clone();
        spec.context.insert("retry_of".into(), json!(task_id));
        spec.context.insert("retry_attempt".into(), json!(attempt));
        self.submit(spec).await
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a queued or running task. Cooperative for running tasks: the
    /// external agent is not killed mid-flight, but its outcome is discarded.
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(DispatchError::NotFound(task_id))?;
        if task.status.is_terminal() {
            return Err(DispatchError::AlreadyTerminal(task_id, task.status));
        }

        if !self.store.cancel_task(task_id, Utc::now()).await? {
            // Lost the race against a terminal transition.
            let status = self
                .store
                .get_task(task_id)
                .await?
                .map(|t| t.status)
                .unwrap_or(task.status);
            return Err(DispatchError::AlreadyTerminal(task_id, status));
        }

        match self.running.lock().await.remove(&task_id) {
            Some(handle) => {
                let _ = handle.cancel_tx.send(());
            }
            // No execution unit is listening (it already cleaned up, or has
            // not registered yet), so nothing else will idle the project.
            None if task.status == TaskStatus::Running => {
                if let Err(err) = self.store.set_project_idle(&task.project_ref).await {
                    warn!(%task_id, error = %err, "could not idle project after cancel");
                }
            }
            None => {}
        }
        self.store
            .append_activity(Some(&task.project_ref), Some(task_id), "task_cancelled", None)
            .await?;
        info!(%task_id, "task cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> Result<DispatcherStats> {
        let system = self.store.status_counts().await?;
        let running = self.running.lock().await.len();
        Ok(DispatcherStats {
            system,
            running,
            queued: self.queued.load(Ordering::SeqCst),
        })
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>) {
        let mut heap: BinaryHeap<QueuedEntry> = BinaryHeap::new();
        loop {
            if heap.is_empty() {
                match self.intake_rx.recv_async().await {
                    Ok(entry) => heap.push(entry),
                    Err(_) => break,
                }
            }
            while let Ok(entry) = self.intake_rx.try_recv() {
                heap.push(entry);
            }

            let permit = match Arc::clone(&self.gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // Everything that arrived while waiting for a slot competes
            // for this permit too.
            while let Ok(entry) = self.intake_rx.try_recv() {
                heap.push(entry);
            }
            let Some(entry) = heap.pop() else {
                drop(permit);
                continue;
            };
            self.queued.fetch_sub(1, Ordering::SeqCst);

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.execute(entry.task_id).await;
                drop(permit);
            });
        }
        debug!("dispatch loop stopped");
    }

    // -----------------------------------------------------------------------
    // Execution unit
    // -----------------------------------------------------------------------

    async fn execute(&self, task_id: Uuid) {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(%task_id, "queued task vanished from the store");
                return;
            }
            Err(err) => {
                error!(%task_id, error = %err, "could not load queued task");
                return;
            }
        };

        match self.store.start_task(task_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled (or otherwise moved on) while queued.
                debug!(%task_id, "task no longer pending, skipping dispatch");
                return;
            }
            Err(err) => {
                error!(%task_id, error = %err, "could not start task");
                return;
            }
        }

        if let Err(err) = self.store.mark_project_busy(&task.project_ref).await {
            warn!(%task_id, error = %err, "could not mark project busy");
        }
        if let Err(err) = self
            .store
            .append_activity(Some(&task.project_ref), Some(task_id), "task_started", None)
            .await
        {
            warn!(%task_id, error = %err, "could not log task start");
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running
            .lock()
            .await
            .insert(task_id, RunningHandle { cancel_tx });

        let deadline = tokio::time::Instant::now() + self.settings.task_timeout;
        let outcome = tokio::select! {
            outcome = self.run_with_deadline(&task, deadline) => outcome,
            _ = cancel_rx => Exec::Cancelled,
        };

        // Cleanup before finalizing so late updates find no waiter.
        self.running.lock().await.remove(&task_id);
        self.waiters.lock().await.remove(&task_id);

        self.finalize(&task, outcome).await;
    }

    async fn run_with_deadline(&self, task: &Task, deadline: tokio::time::Instant) -> Exec {
        match tokio::time::timeout_at(deadline, self.runner.run(task)).await {
            Err(_) => Exec::TimedOut,
            Ok(Err(err)) => Exec::RunnerFailed(err.to_string()),
            Ok(Ok(RunOutcome::Immediate(result))) => Exec::Finished(result),
            Ok(Ok(RunOutcome::Deferred)) => {
                let (tx, rx) = oneshot::channel();
                self.waiters.lock().await.insert(task.id, tx);
                match tokio::time::timeout_at(deadline, rx).await {
                    Err(_) => Exec::TimedOut,
                    // Router dropped our waiter without resolving; treat as
                    // unresolved within the budget.
                    Ok(Err(_)) => Exec::TimedOut,
                    Ok(Ok(resolution)) => Exec::Finished(RunResult {
                        success: resolution.success,
                        payload: resolution.result,
                        error: resolution.error,
                    }),
                }
            }
        }
    }

    async fn finalize(&self, task: &Task, outcome: Exec) {
        match outcome {
            Exec::Cancelled => {
                // cancel() already moved the row and logged the activity.
                if let Err(err) = self.store.set_project_idle(&task.project_ref).await {
                    warn!(task_id = %task.id, error = %err, "could not idle project after cancel");
                }
                info!(task_id = %task.id, "execution unit stopped by cancel");
            }
            Exec::Finished(result) if result.success => {
                self.finalize_success(task, result.payload).await;
            }
            Exec::Finished(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.finalize_failure(task, error).await;
            }
            Exec::RunnerFailed(error) => {
                self.finalize_failure(task, error).await;
            }
            Exec::TimedOut => {
                let error = format!(
                    "timed out after {}s",
                    self.settings.task_timeout.as_secs()
                );
                self.finalize_failure(task, error).await;
            }
        }
    }

    async fn finalize_success(&self, task: &Task, payload: Option<String>) {
        let moved = match self
            .store
            .finish_task(task.id, TaskStatus::Completed, payload, None, Utc::now())
            .await
        {
            Ok(moved) => moved,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "could not persist completion");
                return;
            }
        };
        if !moved {
            // A cancel won the race; its bookkeeping stands, but the busy
            // flag this unit set is now ours to clear.
            debug!(task_id = %task.id, "outcome arrived after terminal transition, discarded");
            if let Err(err) = self.store.set_project_idle(&task.project_ref).await {
                warn!(task_id = %task.id, error = %err, "could not idle project after discard");
            }
            return;
        }

        if let Err(err) = self.store.record_task_outcome(&task.project_ref, true).await {
            warn!(task_id = %task.id, error = %err, "could not record success on project");
        }
        if let Err(err) = self
            .store
            .append_activity(Some(&task.project_ref), Some(task.id), "task_completed", None)
            .await
        {
            warn!(task_id = %task.id, error = %err, "could not log completion");
        }
        info!(task_id = %task.id, project = %task.project_ref, "task completed");

        if self.settings.auto_snapshot {
            self.snapshot_after_success(task).await;
        }
    }

    async fn finalize_failure(&self, task: &Task, error: String) {
        let moved = match self
            .store
            .finish_task(
                task.id,
                TaskStatus::Failed,
                None,
                Some(error.clone()),
                Utc::now(),
            )
            .await
        {
            Ok(moved) => moved,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "could not persist failure");
                return;
            }
        };
        if !moved {
            debug!(task_id = %task.id, "failure arrived after terminal transition, discarded");
            if let Err(err) = self.store.set_project_idle(&task.project_ref).await {
                warn!(task_id = %task.id, error = %err, "could not idle project after discard");
            }
            return;
        }

        if let Err(err) = self
            .store
            .record_task_outcome(&task.project_ref, false)
            .await
        {
            warn!(task_id = %task.id, error = %err, "could not record failure on project");
        }
        if let Err(err) = self
            .store
            .append_activity(
                Some(&task.project_ref),
                Some(task.id),
                "task_failed",
                Some(json!({ "error": error })),
            )
            .await
        {
            warn!(task_id = %task.id, error = %err, "could not log failure");
        }
        warn!(task_id = %task.id, project = %task.project_ref, error = %error, "task failed");
    }

    /// Best-effort: snapshot failures are logged and never touch the task.
    async fn snapshot_after_success(&self, task: &Task) {
        let Some(snapshotter) = &self.snapshotter else {
            return;
        };
        let message = format!("auto snapshot: {}", task.description);
        match snapshotter.snapshot(&task.project_ref, &message).await {
            Ok(outcome) => debug!(task_id = %task.id, ?outcome, "post-completion snapshot"),
            Err(err) => warn!(task_id = %task.id, error = %err, "snapshot failed"),
        }
        match snapshotter.summary(&task.project_ref).await {
            Ok(summary) => {
                if let Err(err) = self
                    .store
                    .set_project_vcs(&task.project_ref, summary.branch, summary.dirty_summary)
                    .await
                {
                    warn!(task_id = %task.id, error = %err, "could not record vcs summary");
                }
            }
            Err(err) => warn!(task_id = %task.id, error = %err, "vcs summary failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Update router
    // -----------------------------------------------------------------------

    /// Single consumer of watcher updates. Progress is logged; resolutions
    /// are handed to the execution unit waiting on them. Updates for tasks
    /// with no waiter (late, stale, or unknown) are discarded.
    async fn update_router(self: Arc<Self>) {
        while let Ok(update) = self.updates_rx.recv_async().await {
            match update {
                ProgressUpdate::Progress {
                    task_id,
                    project_ref,
                    percent,
                    message,
                } => {
                    debug!(%task_id, percent, "progress update");
                    if let Err(err) = self
                        .store
                        .append_activity(
                            Some(&project_ref),
                            Some(task_id),
                            "task_progress",
                            Some(json!({ "percent": percent, "message": message })),
                        )
                        .await
                    {
                        warn!(%task_id, error = %err, "could not log progress");
                    }
                }
                ProgressUpdate::Resolved {
                    task_id,
                    success,
                    result,
                    error,
                    ..
                } => {
                    let waiter = self.waiters.lock().await.remove(&task_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Resolution {
                                success,
                                result,
                                error,
                            });
                        }
                        None => {
                            debug!(%task_id, "discarding resolution with no waiting task");
                        }
                    }
                }
            }
        }
        debug!("update router stopped");
    }
}

/// Exponential backoff for callers that reschedule retries themselves:
/// `base * 2^(attempt-1)`, saturating. Attempts start at 1.
pub fn retry_backoff(attempt: u32, base_delay: Duration) -> Duration {
    base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressLayout;
    use crate::runner::{RunnerError, SimulatedRunner};
    use crate::vcs::{SnapshotOutcome, VcsError, VcsSummary};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    async fn harness(
        runner: Arc<dyn AgentRunner>,
        settings: DispatcherSettings,
    ) -> (Arc<Dispatcher>, Arc<TaskStore>, flume::Sender<ProgressUpdate>) {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let (updates_tx, updates_rx) = flume::unbounded();
        let progress = Arc::new(ProgressChannel::new(
            ProgressLayout::default(),
            updates_tx.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            runner,
            progress,
            None,
            settings,
            updates_rx,
        );
        (dispatcher, store, updates_tx)
    }

    async fn wait_for_status(
        store: &TaskStore,
        id: Uuid,
        status: TaskStatus,
        budget: Duration,
    ) -> Task {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {id} stuck at {:?}, wanted {status:?}", task.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Records dispatch order and the concurrency high-water mark.
    struct ProbeRunner {
        order: std::sync::Mutex<Vec<Uuid>>,
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
        delay: Duration,
    }

    impl ProbeRunner {
        fn new(delay: Duration) -> Self {
            Self {
                order: std::sync::Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ProbeRunner {
        async fn run(&self, task: &Task) -> std::result::Result<RunOutcome, RunnerError> {
            self.order.lock().unwrap().push(task.id);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RunOutcome::Immediate(RunResult::ok("probe done")))
        }
    }

    /// Always defers; the test resolves (or doesn't) via the update channel.
    struct DeferringRunner;

    #[async_trait]
    impl AgentRunner for DeferringRunner {
        async fn run(&self, _task: &Task) -> std::result::Result<RunOutcome, RunnerError> {
            Ok(RunOutcome::Deferred)
        }
    }

    struct RecordingSnapshotter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Snapshotter for RecordingSnapshotter {
        async fn snapshot(
            &self,
            _project_dir: &str,
            _message: &str,
        ) -> std::result::Result<SnapshotOutcome, VcsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SnapshotOutcome::Committed)
        }

        async fn summary(
            &self,
            _project_dir: &str,
        ) -> std::result::Result<VcsSummary, VcsError> {
            Ok(VcsSummary {
                branch: Some("main".into()),
                dirty_summary: None,
            })
        }
    }

    #[tokio::test]
    async fn end_to_end_completion() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(10)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "demo", "do it", TaskPriority::Medium))
            .await
            .unwrap();
        let done =
            wait_for_status(&store, task.id, TaskStatus::Completed, Duration::from_secs(5)).await;

        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert!(done.completed_at.unwrap() > done.started_at.unwrap());
        assert!(done.started_at.unwrap() > done.created_at);
        assert!(done.result.unwrap().contains("demo"));

        let project = store.get_project("/tmp/p").await.unwrap().unwrap();
        assert_eq!(project.completed_count, 1);

        let log = store
            .list_activity(Some("/tmp/p"), Some("task_completed"), 10)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_gate() {
        let runner = Arc::new(ProbeRunner::new(Duration::from_millis(50)));
        let settings = DispatcherSettings {
            max_concurrent: 2,
            ..DispatcherSettings::default()
        };
        let (dispatcher, store, _tx) = harness(Arc::clone(&runner) as _, settings).await;
        dispatcher.start();

        let mut ids = Vec::new();
        for i in 0..8 {
            let task = dispatcher
                .submit(TaskSpec::new(
                    "/tmp/p",
                    format!("t{i}"),
                    "work",
                    TaskPriority::Medium,
                ))
                .await
                .unwrap();
            ids.push(task.id);
        }
        for id in ids {
            wait_for_status(&store, id, TaskStatus::Completed, Duration::from_secs(10)).await;
        }
        assert!(runner.high_water.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn dispatch_follows_priority_then_age() {
        let runner = Arc::new(ProbeRunner::new(Duration::from_millis(5)));
        let settings = DispatcherSettings {
            max_concurrent: 1,
            ..DispatcherSettings::default()
        };
        let (dispatcher, store, _tx) = harness(Arc::clone(&runner) as _, settings).await;

        // Submit before starting the loop so the whole batch is ranked
        // together.
        let low = dispatcher
            .submit(TaskSpec::new("/tmp/p", "low", "w", TaskPriority::Low))
            .await
            .unwrap();
        let high_first = dispatcher
            .submit(TaskSpec::new("/tmp/p", "h1", "w", TaskPriority::High))
            .await
            .unwrap();
        let medium = dispatcher
            .submit(TaskSpec::new("/tmp/p", "m", "w", TaskPriority::Medium))
            .await
            .unwrap();
        let high_second = dispatcher
            .submit(TaskSpec::new("/tmp/p", "h2", "w", TaskPriority::High))
            .await
            .unwrap();

        dispatcher.start();
        for id in [low.id, high_first.id, medium.id, high_second.id] {
            wait_for_status(&store, id, TaskStatus::Completed, Duration::from_secs(5)).await;
        }

        let order = runner.order.lock().unwrap().clone();
        assert_eq!(
            order,
            vec![high_first.id, high_second.id, medium.id, low.id],
            "expected priority desc, then submission order"
        );
    }

    #[tokio::test]
    async fn deferred_task_resolves_from_update() {
        let (dispatcher, store, updates_tx) =
            harness(Arc::new(DeferringRunner), DispatcherSettings::default()).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "handoff", "w", TaskPriority::High))
            .await
            .unwrap();
        wait_for_status(&store, task.id, TaskStatus::Running, Duration::from_secs(5)).await;
        // Give the execution unit a beat to register its waiter.
        tokio::time::sleep(Duration::from_millis(50)).await;

        updates_tx
            .send_async(ProgressUpdate::Resolved {
                task_id: task.id,
                project_ref: task.project_ref.clone(),
                success: true,
                result: Some("external agent finished".into()),
                error: None,
            })
            .await
            .unwrap();

        let done =
            wait_for_status(&store, task.id, TaskStatus::Completed, Duration::from_secs(5)).await;
        assert_eq!(done.result.as_deref(), Some("external agent finished"));
    }

    #[tokio::test]
    async fn deferred_task_times_out_and_late_update_is_discarded() {
        let settings = DispatcherSettings {
            task_timeout: Duration::from_millis(100),
            ..DispatcherSettings::default()
        };
        let (dispatcher, store, updates_tx) =
            harness(Arc::new(DeferringRunner), settings).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "slow", "w", TaskPriority::Medium))
            .await
            .unwrap();
        let failed =
            wait_for_status(&store, task.id, TaskStatus::Failed, Duration::from_secs(5)).await;
        assert!(failed.error.unwrap().contains("timed out"));

        // A resolution arriving after the deadline must not resurrect it.
        updates_tx
            .send_async(ProgressUpdate::Resolved {
                task_id: task.id,
                project_ref: task.project_ref.clone(),
                success: true,
                result: Some("too late".into()),
                error: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let still = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(still.status, TaskStatus::Failed);
        assert!(still.result.is_none());

        let project = store.get_project("/tmp/p").await.unwrap().unwrap();
        assert_eq!(project.failed_count, 1);
        assert_eq!(project.completed_count, 0);
    }

    #[tokio::test]
    async fn progress_updates_land_in_activity_log() {
        let (dispatcher, store, updates_tx) =
            harness(Arc::new(DeferringRunner), DispatcherSettings::default()).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "handoff", "w", TaskPriority::Low))
            .await
            .unwrap();
        wait_for_status(&store, task.id, TaskStatus::Running, Duration::from_secs(5)).await;

        updates_tx
            .send_async(ProgressUpdate::Progress {
                task_id: task.id,
                project_ref: task.project_ref.clone(),
                percent: 40,
                message: "halfway-ish".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let log = store
            .list_activity(Some("/tmp/p"), Some("task_progress"), 10)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        let details = log[0].details.clone().unwrap();
        assert_eq!(details["percent"], 40);
    }

    #[tokio::test]
    async fn cancel_running_task() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_secs(30)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "long", "w", TaskPriority::Medium))
            .await
            .unwrap();
        wait_for_status(&store, task.id, TaskStatus::Running, Duration::from_secs(5)).await;

        dispatcher.cancel(task.id).await.unwrap();
        let cancelled =
            wait_for_status(&store, task.id, TaskStatus::Cancelled, Duration::from_secs(5)).await;
        assert!(cancelled.completed_at.is_some());

        // Second cancel is rejected.
        match dispatcher.cancel(task.id).await {
            Err(DispatchError::AlreadyTerminal(id, status)) => {
                assert_eq!(id, task.id);
                assert_eq!(status, TaskStatus::Cancelled);
            }
            other => panic!("expected AlreadyTerminal, got {other:?}"),
        }

        // Neither counter moves for a cancelled task.
        let project = store.get_project("/tmp/p").await.unwrap().unwrap();
        assert_eq!(project.completed_count, 0);
        assert_eq!(project.failed_count, 0);
    }

    #[tokio::test]
    async fn cancel_idles_project_when_no_unit_is_listening() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(5)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;

        // Move the task to Running by hand, with no dispatch loop and hence
        // no execution unit holding a cancel handle. This is the state a
        // cancel sees when it races past the unit's cleanup.
        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "orphan", "w", TaskPriority::Low))
            .await
            .unwrap();
        store.start_task(task.id, Utc::now()).await.unwrap();
        store.mark_project_busy("/tmp/p").await.unwrap();

        dispatcher.cancel(task.id).await.unwrap();

        let cancelled = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let project = store.get_project("/tmp/p").await.unwrap().unwrap();
        assert_eq!(
            project.agent_status,
            foreman_core::types::AgentStatus::Idle,
            "a cancel with no listening unit must not strand the project busy"
        );
    }

    #[tokio::test]
    async fn cancel_unknown_task() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(5)));
        let (dispatcher, _store, _tx) = harness(runner, DispatcherSettings::default()).await;
        match dispatcher.cancel(Uuid::new_v4()).await {
            Err(DispatchError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_while_queued_is_never_started() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(5)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;

        // Loop not started yet, so the task sits queued.
        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "doomed", "w", TaskPriority::Low))
            .await
            .unwrap();
        dispatcher.cancel(task.id).await.unwrap();

        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let still = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(still.status, TaskStatus::Cancelled);
        assert!(still.started_at.is_none());
    }

    #[tokio::test]
    async fn retry_builds_lineage_and_respects_limit() {
        let runner = Arc::new(SimulatedRunner::failing(Duration::from_millis(5)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;
        dispatcher.start();

        let original = dispatcher
            .submit(TaskSpec::new("/tmp/p", "flaky", "w", TaskPriority::High))
            .await
            .unwrap();
        wait_for_status(&store, original.id, TaskStatus::Failed, Duration::from_secs(5)).await;

        let retry = dispatcher.retry(original.id, 3).await.unwrap();
        assert_ne!(retry.id, original.id);
        assert_eq!(retry.priority, TaskPriority::High);
        assert_eq!(retry.retry_attempt(), 1);
        assert_eq!(
            retry.context.get("retry_of").unwrap().as_str().unwrap(),
            original.id.to_string()
        );
        wait_for_status(&store, retry.id, TaskStatus::Failed, Duration::from_secs(5)).await;

        // The original row is untouched by the retry.
        let first = store.get_task(original.id).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Failed);
        assert!(first.context.get("retry_of").is_none());

        let second = dispatcher.retry(retry.id, 3).await.unwrap();
        assert_eq!(second.retry_attempt(), 2);
        wait_for_status(&store, second.id, TaskStatus::Failed, Duration::from_secs(5)).await;

        match dispatcher.retry(second.id, 2).await {
            Err(DispatchError::RetryLimitExceeded { attempt, max }) => {
                assert_eq!(attempt, 3);
                assert_eq!(max, 2);
            }
            other => panic!("expected RetryLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_rejects_non_failed_tasks() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(10)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "fine", "w", TaskPriority::Low))
            .await
            .unwrap();
        wait_for_status(&store, task.id, TaskStatus::Completed, Duration::from_secs(5)).await;

        match dispatcher.retry(task.id, 3).await {
            Err(DispatchError::NotFailed(id, status)) => {
                assert_eq!(id, task.id);
                assert_eq!(status, TaskStatus::Completed);
            }
            other => panic!("expected NotFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn template_submission_renders_and_counts() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(5)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;
        dispatcher.start();

        let template = foreman_core::types::TaskTemplate::new(
            "refactor",
            "Refactor {module}",
            "Refactor the {module} module",
            TaskPriority::High,
        );
        store.save_template(&template).await.unwrap();

        let mut values = HashMap::new();
        values.insert("module".to_string(), "parser".to_string());
        let task = dispatcher
            .submit_from_template("refactor", "/tmp/p", &values)
            .await
            .unwrap();
        assert_eq!(task.description, "Refactor parser");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.context.get("template").unwrap(), "refactor");

        let stored = store.get_template("refactor").await.unwrap().unwrap();
        assert_eq!(stored.use_count, 1);

        // Exactly one bump per task actually created.
        dispatcher
            .submit_from_template("refactor", "/tmp/p", &values)
            .await
            .unwrap();
        let stored = store.get_template("refactor").await.unwrap().unwrap();
        assert_eq!(stored.use_count, 2);

        match dispatcher
            .submit_from_template("missing", "/tmp/p", &values)
            .await
        {
            Err(DispatchError::TemplateNotFound(name)) => assert_eq!(name, "missing"),
            other => panic!("expected TemplateNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_task_triggers_snapshot() {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let (updates_tx, updates_rx) = flume::unbounded();
        let progress = Arc::new(ProgressChannel::new(ProgressLayout::default(), updates_tx));
        let snapshotter = Arc::new(RecordingSnapshotter {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(SimulatedRunner::new(Duration::from_millis(5))),
            progress,
            Some(Arc::clone(&snapshotter) as _),
            DispatcherSettings::default(),
            updates_rx,
        );
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "snap", "w", TaskPriority::Low))
            .await
            .unwrap();
        wait_for_status(&store, task.id, TaskStatus::Completed, Duration::from_secs(5)).await;
        // Snapshotting happens after the terminal write; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(snapshotter.calls.load(Ordering::SeqCst), 1);
        let project = store.get_project("/tmp/p").await.unwrap().unwrap();
        assert_eq!(project.git_branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn stats_reflect_store_counts() {
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(5)));
        let (dispatcher, store, _tx) = harness(runner, DispatcherSettings::default()).await;
        dispatcher.start();

        let task = dispatcher
            .submit(TaskSpec::new("/tmp/p", "one", "w", TaskPriority::Low))
            .await
            .unwrap();
        wait_for_status(&store, task.id, TaskStatus::Completed, Duration::from_secs(5)).await;

        let stats = dispatcher.stats().await.unwrap();
        assert_eq!(stats.system.total, 1);
        assert_eq!(stats.system.completed, 1);
        assert_eq!(stats.running, 0);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(retry_backoff(1, base), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, base), Duration::from_secs(4));
        assert_eq!(retry_backoff(3, base), Duration::from_secs(8));
        // Attempt 0 is treated like the first attempt.
        assert_eq!(retry_backoff(0, base), Duration::from_secs(2));
        // Huge attempts saturate instead of overflowing.
        let _ = retry_backoff(u32::MAX, base);
    }
}
