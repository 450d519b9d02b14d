//! Task scheduler - admits queued work under a concurrency cap.
//!
//! Work is queued in a [`PriorityQueue`] and admitted by a single admission
//! loop while the running set is below `max_concurrent`. When no slot is
//! free the loop parks on a completion signal; every completion (and every
//! newly scheduled task) wakes it. Each admitted task races its unit of work
//! against an independent timeout. A timed-out task's work keeps running
//! detached in the background, but its result is discarded.
//!
//! Every task ends with exactly one [`TaskCompletion`] on the completion
//! stream: success, failure, timeout, cancellation or shutdown.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::queue::{Prioritized, PriorityQueue};
use super::recovery::join_error_to_error;
use super::types::TaskPriority;
use crate::events::{EmitOptions, EventBus, EventType};
use crate::types::{Error, Result, SchedulerError, TaskId};

/// Deferred unit of work. Resolves to a JSON result or a kernel error.
pub type TaskWork = BoxFuture<'static, Result<serde_json::Value>>;

const EVENT_SOURCE: &str = "scheduler";

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once.
    pub max_concurrent: usize,
    /// Timeout applied when `schedule` is given none.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Completions remembered for late `wait_for` callers.
    pub completion_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_timeout: Duration::from_secs(60),
            completion_history: 256,
        }
    }
}

// =============================================================================
// Task types
// =============================================================================

/// A queued task: metadata plus its deferred work.
pub struct ScheduledTask {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    enqueued: Instant,
    work: TaskWork,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Prioritized for ScheduledTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }
}

/// Caller-facing receipt for a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Terminal record for a task. Emitted exactly once per task.
#[derive(Debug)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub outcome: Result<serde_json::Value>,
    /// Time spent queued before admission.
    pub wait: Duration,
    /// Time from admission to settlement (zero if never admitted).
    pub execution: Duration,
    pub completed_at: DateTime<Utc>,
}

impl TaskCompletion {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Scheduler counters and running averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_wait_ms: f64,
    pub avg_execution_ms: f64,
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    ShutDown,
}

#[derive(Debug)]
struct SchedulerState {
    queue: PriorityQueue<ScheduledTask>,
    running: HashSet<TaskId>,
    run_state: RunState,
    admission: Option<CancellationToken>,
    recent: VecDeque<Arc<TaskCompletion>>,
    metrics: SchedulerMetrics,
    admitted: u64,
}

#[derive(Debug)]
struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    wake: Notify,
    completions: broadcast::Sender<Arc<TaskCompletion>>,
    metrics: watch::Sender<SchedulerMetrics>,
    events: Option<EventBus>,
}

/// Priority scheduler handle. Cheap to clone; clones share one queue.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, None)
    }

    /// Scheduler that announces task lifecycle on `events`.
    pub fn with_event_bus(config: SchedulerConfig, events: EventBus) -> Self {
        Self::build(config, Some(events))
    }

    fn build(config: SchedulerConfig, events: Option<EventBus>) -> Self {
        let (completions, _) = broadcast::channel(config.completion_history.max(16));
        let (metrics, _) = watch::channel(SchedulerMetrics::default());
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    queue: PriorityQueue::new(),
                    running: HashSet::new(),
                    run_state: RunState::Stopped,
                    admission: None,
                    recent: VecDeque::with_capacity(config.completion_history),
                    metrics: SchedulerMetrics::default(),
                    admitted: 0,
                }),
                config,
                wake: Notify::new(),
                completions,
                metrics,
                events,
            }),
        }
    }

    /// Begin admitting queued work. Must be called inside a tokio runtime.
    pub fn start(&self) -> std::result::Result<(), SchedulerError> {
        let mut state = self.inner.lock();
        match state.run_state {
            RunState::ShutDown => return Err(SchedulerError::SchedulerStopped),
            RunState::Running => return Ok(()),
            RunState::Stopped => {}
        }
        let token = CancellationToken::new();
        state.run_state = RunState::Running;
        state.admission = Some(token.clone());
        drop(state);

        tokio::spawn(admission_loop(self.inner.clone(), token));
        tracing::info!(
            max_concurrent = self.inner.config.max_concurrent,
            "scheduler_started"
        );
        Ok(())
    }

    /// Pause admission. Queued work stays queued; running work finishes.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if state.run_state == RunState::Running {
            state.run_state = RunState::Stopped;
            if let Some(token) = state.admission.take() {
                token.cancel();
            }
            tracing::info!(queued = state.queue.size(), "scheduler_stopped");
        }
    }

    /// Stop for good. Every still-queued task completes with
    /// `SCHEDULER_STOPPED`; further `schedule` calls are refused.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.inner.lock();
            if state.run_state == RunState::ShutDown {
                return;
            }
            state.run_state = RunState::ShutDown;
            if let Some(token) = state.admission.take() {
                token.cancel();
            }
            state.queue.drain()
        };

        tracing::info!(drained = drained.len(), "scheduler_shutdown");
        for task in drained {
            let wait = task.enqueued.elapsed();
            self.inner.finish(
                task.id,
                task.priority,
                Err(SchedulerError::SchedulerStopped.into()),
                wait,
                Duration::ZERO,
                false,
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().run_state == RunState::Running
    }

    /// Queue a unit of work; admission is attempted right away if running.
    pub fn schedule<F>(
        &self,
        work: F,
        priority: TaskPriority,
        timeout: Option<Duration>,
    ) -> std::result::Result<TaskHandle, SchedulerError>
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let task = ScheduledTask {
            id: TaskId::new(),
            priority,
            created_at: Utc::now(),
            timeout: timeout.unwrap_or(self.inner.config.default_timeout),
            enqueued: Instant::now(),
            work: work.boxed(),
        };
        let handle = TaskHandle {
            id: task.id.clone(),
            priority: task.priority,
            created_at: task.created_at,
            timeout: task.timeout,
        };

        {
            let mut state = self.inner.lock();
            if state.run_state == RunState::ShutDown {
                return Err(SchedulerError::SchedulerStopped);
            }
            state.queue.enqueue(task);
            self.inner.publish_metrics(&mut state);
        }

        tracing::debug!(task_id = %handle.id, priority = ?priority, "task_scheduled");
        self.inner.emit(
            EventType::TaskScheduled,
            &handle.id,
            serde_json::json!({ "priority": priority }),
        );
        self.inner.wake.notify_one();
        Ok(handle)
    }

    /// Cancel a task that has not been admitted yet.
    ///
    /// Returns false for running, finished or unknown tasks; admitted work
    /// cannot be preempted.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let removed = self.inner.lock().queue.remove(id);
        match removed {
            Some(task) => {
                let wait = task.enqueued.elapsed();
                self.inner.finish(
                    task.id.clone(),
                    task.priority,
                    Err(SchedulerError::TaskCancelled(task.id).into()),
                    wait,
                    Duration::ZERO,
                    false,
                );
                true
            }
            None => false,
        }
    }

    /// Wait for a task's completion record.
    ///
    /// This timeout is independent of the task's own execution timeout; when
    /// it elapses the task keeps going and a later `wait_for` can still
    /// observe its completion.
    pub fn wait_for(
        &self,
        id: &TaskId,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Arc<TaskCompletion>>> + Send + 'static {
        let completions = self.inner.completions.subscribe();
        let wait = next_completion(self.inner.clone(), id.clone(), completions);
        let id = id.clone();

        async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, wait).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "task {} did not complete within {}ms",
                        id,
                        limit.as_millis()
                    ))),
                },
                None => wait.await,
            }
        }
    }

    /// Stream of every completion record.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<Arc<TaskCompletion>> {
        self.inner.completions.subscribe()
    }

    /// Current metrics, then every change.
    pub fn subscribe_metrics(&self) -> watch::Receiver<SchedulerMetrics> {
        self.inner.metrics.subscribe()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner.lock().metrics.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.size()
    }

    pub fn queue_depth_at(&self, priority: TaskPriority) -> usize {
        self.inner.lock().queue.size_at(priority)
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event_type: EventType, task_id: &TaskId, payload: serde_json::Value) {
        if let Some(ref events) = self.events {
            events.emit_with(
                event_type,
                EVENT_SOURCE,
                payload,
                EmitOptions::correlated(task_id.as_str()),
            );
        }
    }

    fn publish_metrics(&self, state: &mut SchedulerState) {
        state.metrics.queued = state.queue.size();
        state.metrics.running = state.running.len();
        self.metrics.send_replace(state.metrics.clone());
    }

    /// Admit as many queued tasks as free slots allow.
    fn admit_ready(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut state = self.lock();
            if state.run_state != RunState::Running {
                return;
            }
            while state.running.len() < self.config.max_concurrent {
                let Some(task) = state.queue.dequeue() else {
                    break;
                };
                state.running.insert(task.id.clone());
                admitted.push(task);
            }
            if !admitted.is_empty() {
                self.publish_metrics(&mut state);
            }
        }

        for task in admitted {
            tracing::debug!(task_id = %task.id, priority = ?task.priority, "task_admitted");
            self.emit(
                EventType::TaskStarted,
                &task.id,
                serde_json::json!({ "priority": task.priority }),
            );
            tokio::spawn(run_task(self.clone(), task));
        }
    }

    fn lookup_completion(&self, id: &TaskId) -> Result<Option<Arc<TaskCompletion>>> {
        let state = self.lock();
        if let Some(done) = state.recent.iter().rev().find(|c| &c.task_id == id) {
            return Ok(Some(done.clone()));
        }
        if state.queue.contains(id) || state.running.contains(id) {
            return Ok(None);
        }
        Err(SchedulerError::TaskNotFound(id.clone()).into())
    }

    /// Record a terminal outcome, publish it once, and wake admission.
    fn finish(
        &self,
        task_id: TaskId,
        priority: TaskPriority,
        outcome: Result<serde_json::Value>,
        wait: Duration,
        execution: Duration,
        was_admitted: bool,
    ) {
        let completion = Arc::new(TaskCompletion {
            task_id,
            priority,
            outcome,
            wait,
            execution,
            completed_at: Utc::now(),
        });

        {
            let mut state = self.lock();
            state.running.remove(&completion.task_id);

            let cancelled = matches!(
                completion.outcome,
                Err(Error::Scheduler(SchedulerError::TaskCancelled(_)))
            );
            if cancelled {
                state.metrics.cancelled += 1;
            } else if completion.succeeded() {
                state.metrics.completed += 1;
            } else {
                state.metrics.failed += 1;
            }

            if was_admitted {
                state.admitted += 1;
                let n = state.admitted as f64;
                let wait_ms = wait.as_secs_f64() * 1000.0;
                let exec_ms = execution.as_secs_f64() * 1000.0;
                state.metrics.avg_wait_ms += (wait_ms - state.metrics.avg_wait_ms) / n;
                state.metrics.avg_execution_ms += (exec_ms - state.metrics.avg_execution_ms) / n;
            }

            if self.config.completion_history > 0 {
                if state.recent.len() >= self.config.completion_history {
                    state.recent.pop_front();
                }
                state.recent.push_back(completion.clone());
            }
            self.publish_metrics(&mut state);
        }

        match completion.outcome {
            Ok(_) => {
                tracing::debug!(
                    task_id = %completion.task_id,
                    execution_ms = execution.as_millis() as u64,
                    "task_completed"
                );
                self.emit(
                    EventType::TaskCompleted,
                    &completion.task_id,
                    serde_json::json!({ "execution_ms": execution.as_millis() as u64 }),
                );
            }
            Err(ref err) => {
                let event_type = if matches!(err, Error::Scheduler(SchedulerError::TaskCancelled(_))) {
                    EventType::TaskCancelled
                } else {
                    tracing::warn!(task_id = %completion.task_id, code = err.code(), error = %err, "task_failed");
                    EventType::TaskFailed
                };
                self.emit(
                    event_type,
                    &completion.task_id,
                    serde_json::json!({ "code": err.code(), "error": err.to_string() }),
                );
            }
        }

        // No receivers is fine; late waiters use the recent ring.
        let _ = self.completions.send(completion);
        self.wake.notify_one();
    }
}

/// Resolve with `id`'s completion, checking the recent ring before each wait.
async fn next_completion(
    inner: Arc<Inner>,
    id: TaskId,
    mut completions: broadcast::Receiver<Arc<TaskCompletion>>,
) -> Result<Arc<TaskCompletion>> {
    loop {
        if let Some(done) = inner.lookup_completion(&id)? {
            return Ok(done);
        }
        match completions.recv().await {
            Ok(done) if done.task_id == id => return Ok(done),
            Ok(_) => continue,
            // Missed some records; the ring lookup above catches up.
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(SchedulerError::SchedulerStopped.into())
            }
        }
    }
}

/// Single admission loop: fill free slots, then park until something changes.
async fn admission_loop(inner: Arc<Inner>, token: CancellationToken) {
    loop {
        inner.admit_ready();
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = token.cancelled() => break,
        }
    }
    tracing::debug!("admission_loop_exited");
}

/// Race one task's work against its timeout.
async fn run_task(inner: Arc<Inner>, task: ScheduledTask) {
    let admitted_at = Instant::now();
    let wait = admitted_at.duration_since(task.enqueued);
    let ScheduledTask {
        id,
        priority,
        timeout,
        work,
        ..
    } = task;

    // Spawned separately so a timeout detaches the work instead of dropping it.
    let handle = tokio::spawn(work);
    let outcome = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(join_error_to_error(join_err, "scheduled task")),
        Err(_) => Err(SchedulerError::TaskTimeout {
            task_id: id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
        .into()),
    };

    inner.finish(id, priority, outcome, wait, admitted_at.elapsed(), true);
}
