use crate::history::JobMonitor;
use crate::queue::TaskQueue;
use serde::{Deserialize, Serialize};
use simcore::{
    Clock, EventBus, ExecutionEvent, Params, PipelineError, Task, TaskId, TaskSpec, TaskStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Sleep between polls in every wait loop.
    pub poll_interval: Duration,
    /// Per-task wait used by sequential and batch submission.
    pub task_timeout: Duration,
    /// Group size for batch submission.
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(3600),
            batch_size: default_batch_size(),
        }
    }
}

/// Twice the number of available cores.
pub fn default_batch_size() -> usize {
    num_cpus::get().max(1) * 2
}

/// Reported to the progress callback after each batch is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch_index: usize,
    pub batch_count: usize,
    pub submitted: usize,
    pub total: usize,
    pub task_ids: Vec<TaskId>,
}

/// Ordered parameter grid for sweeps. The first axis is the outermost loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    axes: Vec<(String, Vec<serde_json::Value>)>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis<V: Into<serde_json::Value>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.axes
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Build from a JSON object of `name -> [values]`. Axis order follows the
    /// map's iteration order.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut grid = Self::new();
        for (name, values) in obj {
            let values = match values {
                serde_json::Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            grid.axes.push((name.clone(), values));
        }
        Some(grid)
    }

    pub fn len(&self) -> usize {
        if self.axes.is_empty() {
            return 0;
        }
        self.axes.iter().map(|(_, v)| v.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cartesian product in nested declaration order.
    pub fn combinations(&self) -> Vec<Params> {
        if self.axes.is_empty() {
            return Vec::new();
        }
        let mut combos = vec![Params::new()];
        for (name, values) in &self.axes {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut params = combo.clone();
                    params.insert(name.clone(), value.clone());
                    next.push(params);
                }
            }
            combos = next;
        }
        combos
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelStats {
    pub task_count: usize,
    pub completed: usize,
    pub total_duration_secs: f64,
    pub avg_duration_secs: f64,
    pub max_duration_secs: f64,
    pub wall_clock_secs: f64,
    pub speedup: f64,
    pub efficiency: f64,
}

/// Submission and monitoring façade over a [`TaskQueue`].
pub struct TaskPipeline {
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: PipelineConfig,
    tasks: RwLock<HashMap<TaskId, Task>>,
    monitor: Option<Arc<JobMonitor>>,
}

impl TaskPipeline {
    pub fn new(queue: Arc<dyn TaskQueue>, clock: Arc<dyn Clock>, config: PipelineConfig) -> Self {
        Self {
            queue,
            clock,
            events: EventBus::default(),
            config,
            tasks: RwLock::new(HashMap::new()),
            monitor: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Write a job-history record whenever a task is first seen terminal.
    pub fn with_monitor(mut self, monitor: Arc<JobMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Snapshot of a task this pipeline submitted.
    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn submit_task(
        &self,
        tool: &str,
        script: &str,
        params: Params,
    ) -> Result<TaskId, PipelineError> {
        self.submit(&TaskSpec::new(tool, script).with_params(params))
            .await
    }

    pub async fn submit(&self, spec: &TaskSpec) -> Result<TaskId, PipelineError> {
        let task_id = self.queue.submit(spec).await.map_err(|e| {
            warn!(tool = %spec.tool, script = %spec.script, error = %e, "Task submission failed");
            PipelineError::from(e)
        })?;
        let now = self.clock.now();

        info!(task_id = %task_id, tool = %spec.tool, script = %spec.script, "Submitted task");
        self.tasks
            .write()
            .await
            .insert(task_id.clone(), Task::new(task_id.clone(), spec.clone(), now));
        self.events.emit(ExecutionEvent::TaskSubmitted {
            task_id: task_id.clone(),
            tool: spec.tool.clone(),
            script: spec.script.clone(),
            timestamp: now,
        });
        Ok(task_id)
    }

    /// Non-blocking status query. Terminal statuses are served from the local
    /// record without touching the queue again.
    pub async fn get_status(&self, task_id: &TaskId) -> Result<TaskStatus, PipelineError> {
        if let Some(task) = self.tasks.read().await.get(task_id) {
            if task.status.is_terminal() {
                return Ok(task.status.clone());
            }
        }

        let status = self.queue.poll(task_id).await?;

        let (status, finished_task) = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                Some(task) => {
                    let changed = task.observe(status.clone());
                    if changed {
                        debug!(task_id = %task_id, state = %task.status.state, "Task status changed");
                    }
                    let snapshot = changed && task.status.is_terminal();
                    let status = task.status.clone();
                    (status, snapshot.then(|| task.clone()))
                }
                None => (status, None),
            }
        };

        if let Some(task) = finished_task {
            self.on_finished(&task).await;
        }
        Ok(status)
    }

    async fn on_finished(&self, task: &Task) {
        info!(task_id = %task.id, state = %task.status.state, "Task finished");
        self.events.emit(ExecutionEvent::TaskFinished {
            task_id: task.id.clone(),
            state: task.status.state,
            timestamp: self.clock.now(),
        });
        if let Some(monitor) = &self.monitor {
            if let Err(e) = monitor.record(task).await {
                warn!(task_id = %task.id, error = %e, "Failed to write job history");
            }
        }
    }

    /// Poll until the task is terminal. On timeout the task keeps running.
    pub async fn wait_for_task(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<TaskStatus, PipelineError> {
        let started = self.clock.now();
        loop {
            let status = self.get_status(task_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            self.pause(started, timeout, std::slice::from_ref(task_id))
                .await?;
        }
    }

    /// Sleep one poll interval, or fail if the wait budget is spent.
    async fn pause(
        &self,
        started: chrono::DateTime<chrono::Utc>,
        timeout: Duration,
        task_ids: &[TaskId],
    ) -> Result<(), PipelineError> {
        let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
        if elapsed >= timeout {
            debug!(tasks = task_ids.len(), ?timeout, "Wait timed out");
            return Err(PipelineError::Timeout {
                task_ids: task_ids.to_vec(),
                waited: elapsed,
            });
        }
        let remaining = timeout - elapsed;
        self.clock.sleep(self.config.poll_interval.min(remaining)).await;
        Ok(())
    }

    /// Stop tracking a task. Later queries go straight to the queue.
    pub async fn forget(&self, task_id: &TaskId) -> bool {
        self.tasks.write().await.remove(task_id).is_some()
    }

    /// Purge terminal tasks here and in the queue. Purged ids report
    /// `UnknownTask` afterwards.
    pub async fn purge_finished(&self) -> usize {
        let forgotten = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|_, t| !t.status.is_terminal());
            before - tasks.len()
        };
        let purged = self.queue.purge_finished().await;
        debug!(forgotten, purged, "Purged finished tasks");
        purged.max(forgotten)
    }

    /// Number of tasks this pipeline still tracks.
    pub async fn tracked(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Best-effort cancellation; false if the task already finished.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<bool, PipelineError> {
        if self.get_status(task_id).await?.is_terminal() {
            return Ok(false);
        }
        let cancelled = self.queue.cancel(task_id).await?;
        info!(task_id = %task_id, cancelled, "Cancellation requested");
        Ok(cancelled)
    }

    /// Submit a list of tasks. Sequential mode waits for each task before
    /// submitting the next and stops at the first task that does not
    /// succeed; parallel mode submits everything up front.
    pub async fn submit_workflow(
        &self,
        tasks: &[TaskSpec],
        sequential: bool,
    ) -> Result<Vec<TaskId>, PipelineError> {
        let mut ids = Vec::with_capacity(tasks.len());

        if !sequential {
            for spec in tasks {
                ids.push(self.submit(spec).await?);
            }
            info!(count = ids.len(), "Submitted parallel workflow");
            return Ok(ids);
        }

        for (index, spec) in tasks.iter().enumerate() {
            let task_id = self.submit(spec).await?;
            ids.push(task_id.clone());

            let status = self.wait_for_task(&task_id, self.config.task_timeout).await?;
            if !status.state.is_success() {
                warn!(
                    index,
                    task_id = %task_id,
                    state = %status.state,
                    "Sequential workflow stopped"
                );
                return Err(PipelineError::StepFailed {
                    index,
                    task_id,
                    state: status.state,
                    error: status.error,
                    submitted: ids,
                });
            }
        }
        info!(count = ids.len(), "Sequential workflow completed");
        Ok(ids)
    }

    /// Submit in groups of `batch_size` (default from config), waiting for
    /// each group to finish before the next so the broker never holds more
    /// than one group in flight.
    pub async fn submit_batch_workflow<F>(
        &self,
        tasks: &[TaskSpec],
        batch_size: Option<usize>,
        mut on_batch: F,
    ) -> Result<Vec<TaskId>, PipelineError>
    where
        F: FnMut(&BatchProgress),
    {
        let batch_size = batch_size.unwrap_or(self.config.batch_size).max(1);
        let batch_count = tasks.len().div_ceil(batch_size);
        let mut ids = Vec::with_capacity(tasks.len());

        for (batch_index, chunk) in tasks.chunks(batch_size).enumerate() {
            let mut batch_ids = Vec::with_capacity(chunk.len());
            for spec in chunk {
                batch_ids.push(self.submit(spec).await?);
            }
            ids.extend(batch_ids.iter().cloned());

            debug!(batch = batch_index + 1, of = batch_count, "Batch submitted");
            on_batch(&BatchProgress {
                batch_index,
                batch_count,
                submitted: ids.len(),
                total: tasks.len(),
                task_ids: batch_ids.clone(),
            });

            if batch_index + 1 < batch_count {
                self.wait_for_all(&batch_ids, self.config.task_timeout).await?;
            }
        }
        Ok(ids)
    }

    /// One task per combination of the grid.
    pub async fn parameter_sweep(
        &self,
        tool: &str,
        script: &str,
        grid: &ParamGrid,
    ) -> Result<Vec<TaskId>, PipelineError> {
        let combos = grid.combinations();
        info!(tool, script, combinations = combos.len(), "Starting parameter sweep");
        let mut ids = Vec::with_capacity(combos.len());
        for params in combos {
            ids.push(self.submit_task(tool, script, params).await?);
        }
        Ok(ids)
    }

    /// First task (in `task_ids` order within a polling round) to reach a
    /// terminal state. The other tasks are left alone.
    pub async fn wait_for_any(
        &self,
        task_ids: &[TaskId],
        timeout: Duration,
    ) -> Result<(TaskId, TaskStatus), PipelineError> {
        if task_ids.is_empty() {
            return Err(PipelineError::EmptyTaskSet);
        }
        let started = self.clock.now();
        loop {
            for task_id in task_ids {
                let status = self.get_status(task_id).await?;
                if status.is_terminal() {
                    return Ok((task_id.clone(), status));
                }
            }
            self.pause(started, timeout, task_ids).await?;
        }
    }

    /// Wait until every task is terminal; statuses come back in input order.
    pub async fn wait_for_all(
        &self,
        task_ids: &[TaskId],
        timeout: Duration,
    ) -> Result<Vec<TaskStatus>, PipelineError> {
        let started = self.clock.now();
        let mut statuses: Vec<Option<TaskStatus>> = vec![None; task_ids.len()];
        loop {
            for (slot, task_id) in statuses.iter_mut().zip(task_ids) {
                if slot.is_none() {
                    let status = self.get_status(task_id).await?;
                    if status.is_terminal() {
                        *slot = Some(status);
                    }
                }
            }

            if statuses.iter().all(Option::is_some) {
                return Ok(statuses.into_iter().flatten().collect());
            }

            let waiting: Vec<TaskId> = statuses
                .iter()
                .zip(task_ids)
                .filter(|(s, _)| s.is_none())
                .map(|(_, id)| id.clone())
                .collect();
            self.pause(started, timeout, &waiting).await?;
        }
    }

    /// Duration and speedup figures over the terminal tasks in `task_ids`.
    pub async fn get_parallel_execution_stats(
        &self,
        task_ids: &[TaskId],
    ) -> Result<ParallelStats, PipelineError> {
        let mut spans = Vec::new();
        for task_id in task_ids {
            let status = self.get_status(task_id).await?;
            if !status.is_terminal() {
                continue;
            }
            let submitted = self.task(task_id).await.map(|t| t.submitted_at);
            let start = status.started_at.or(submitted);
            let end = status.finished_at;
            if let (Some(start), Some(end)) = (start, end) {
                spans.push((start, end));
            }
        }

        let mut stats = ParallelStats {
            task_count: task_ids.len(),
            completed: spans.len(),
            ..Default::default()
        };
        if spans.is_empty() {
            return Ok(stats);
        }

        let durations: Vec<f64> = spans
            .iter()
            .map(|(s, e)| (*e - *s).to_std().unwrap_or_default().as_secs_f64())
            .collect();
        let first_start = spans.iter().map(|(s, _)| *s).min().unwrap_or_default();
        let last_end = spans.iter().map(|(_, e)| *e).max().unwrap_or_default();

        stats.total_duration_secs = durations.iter().sum();
        stats.avg_duration_secs = stats.total_duration_secs / durations.len() as f64;
        stats.max_duration_secs = durations.iter().cloned().fold(0.0, f64::max);
        stats.wall_clock_secs = (last_end - first_start)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        if stats.wall_clock_secs > 0.0 {
            stats.speedup = stats.total_duration_secs / stats.wall_clock_secs;
            stats.efficiency = stats.speedup / stats.completed as f64;
        }
        Ok(stats)
    }
}
