use crate::queue::TaskQueue;
use crate::registry::{ProgressHandle, ToolContext, ToolRegistry};
use async_trait::async_trait;
use simcore::{Clock, QueueError, SystemClock, TaskId, TaskSpec, TaskState, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct LocalTask {
    status: TaskStatus,
    progress: ProgressHandle,
    cancellation: CancellationToken,
}

/// In-process worker pool implementing [`TaskQueue`].
///
/// Each submission is spawned on the tokio runtime and waits for one of
/// `workers` permits before the tool runs, so at most `workers` tools execute
/// at once while the rest stay `Pending`.
pub struct LocalQueue {
    registry: Arc<ToolRegistry>,
    tasks: Arc<RwLock<HashMap<TaskId, LocalTask>>>,
    workers: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    accepting: AtomicBool,
}

impl LocalQueue {
    pub fn new(registry: Arc<ToolRegistry>, workers: usize) -> Self {
        Self::with_clock(registry, workers, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: Arc<ToolRegistry>, workers: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            clock,
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop accepting submissions; already queued tasks still run.
    pub fn shutdown(&self) {
        info!("Local queue shutting down");
        self.accepting.store(false, Ordering::SeqCst);
    }

    async fn set_status(
        tasks: &RwLock<HashMap<TaskId, LocalTask>>,
        task_id: &TaskId,
        status: TaskStatus,
    ) {
        if let Some(task) = tasks.write().await.get_mut(task_id) {
            if !task.status.is_terminal() {
                task.status = status;
            }
        }
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    /// Forget terminal tasks. Later polls for them report `UnknownTask`.
    async fn purge_finished(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !t.status.is_terminal());
        before - tasks.len()
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<TaskId, QueueError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("local queue is shut down".to_string()));
        }

        let tool = self
            .registry
            .get(&spec.tool)
            .map_err(|e| QueueError::Rejected(e.to_string()))?;
        tool.validate_params(&spec.script, &spec.params)
            .map_err(|e| QueueError::Rejected(e.to_string()))?;

        let task_id = TaskId::generate();
        let progress = ProgressHandle::default();
        let cancellation = CancellationToken::new();

        self.tasks.write().await.insert(
            task_id.clone(),
            LocalTask {
                status: TaskStatus::pending(),
                progress: progress.clone(),
                cancellation: cancellation.clone(),
            },
        );

        let ctx = ToolContext {
            task_id: task_id.clone(),
            script: spec.script.clone(),
            params: spec.params.clone(),
            progress,
            cancellation: cancellation.clone(),
        };
        let tasks = self.tasks.clone();
        let workers = self.workers.clone();
        let clock = self.clock.clone();
        let id = task_id.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancellation.cancelled() => None,
                permit = workers.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                debug!(task_id = %id, "Task cancelled before a worker picked it up");
                let now = clock.now();
                Self::set_status(&tasks, &id, TaskStatus::cancelled().with_times(None, Some(now))).await;
                return;
            };

            let started = clock.now();
            Self::set_status(&tasks, &id, TaskStatus::running(Some(0)).with_times(Some(started), None)).await;
            debug!(task_id = %id, tool = %tool.name(), "Task started");

            let outcome = tokio::select! {
                biased;
                result = tool.run(ctx) => Some(result),
                _ = cancellation.cancelled() => None,
            };

            let finished = clock.now();
            let status = match outcome {
                Some(Ok(output)) => TaskStatus::success(output.result),
                Some(Err(e)) => {
                    warn!(task_id = %id, error = %e, "Task failed");
                    let status = if matches!(e, simcore::ToolError::Timeout { .. }) {
                        TaskStatus::timeout(e.to_string())
                    } else if matches!(e, simcore::ToolError::Cancelled) {
                        TaskStatus::cancelled()
                    } else {
                        TaskStatus::failure(e.to_string())
                    };
                    status.with_code(e.code())
                }
                None => TaskStatus::cancelled(),
            };
            debug!(task_id = %id, state = %status.state, "Task finished");
            Self::set_status(&tasks, &id, status.with_times(Some(started), Some(finished))).await;
        });

        Ok(task_id)
    }

    async fn poll(&self, task_id: &TaskId) -> Result<TaskStatus, QueueError> {
        let tasks = self.tasks.read().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.clone()))?;

        let mut status = task.status.clone();
        if status.state == TaskState::Running {
            status.progress = Some(task.progress.get());
        }
        Ok(status)
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let tasks = self.tasks.read().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.clone()))?;

        if task.status.is_terminal() {
            return Ok(false);
        }
        info!(task_id = %task_id, "Cancelling task");
        task.cancellation.cancel();
        Ok(true)
    }
}
