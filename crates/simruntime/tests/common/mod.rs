//! Shared fixtures: a queue whose tasks follow a script written into their
//! params, driven by a manual clock.
//!
//! Recognised params:
//! - `delay` seconds spent pending (default 0)
//! - `duration` seconds spent running (default 1)
//! - `outcome` `success` | `failure` | `timeout` (default success)
//! - `error`, `code` reported on failure
//! - `result` payload reported on success (default `{"script": ...}`)
//! - `fail_times` fail the first N submissions of this script, then follow
//!   `outcome`

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use simcore::{Clock, ManualClock, QueueError, TaskId, TaskSpec, TaskStatus};
use simruntime::{
    ExecutorConfig, PipelineConfig, RouterConfig, TaskPipeline, TaskQueue, WorkflowExecutor,
    WorkflowRouter,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

struct Entry {
    spec: TaskSpec,
    submitted_at: DateTime<Utc>,
    fail: bool,
    cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    next_id: usize,
    tasks: HashMap<TaskId, Entry>,
    submitted: Vec<(TaskId, TaskSpec, DateTime<Utc>)>,
    cancelled: Vec<TaskId>,
    polls: HashMap<TaskId, usize>,
    attempts: HashMap<String, u64>,
    unavailable: bool,
}

pub struct ScriptedQueue {
    clock: Arc<ManualClock>,
    inner: Mutex<Inner>,
}

fn secs_param(spec: &TaskSpec, key: &str, default: f64) -> chrono::Duration {
    let secs = spec.params.get(key).and_then(|v| v.as_f64()).unwrap_or(default);
    chrono::Duration::milliseconds((secs * 1000.0) as i64)
}

impl ScriptedQueue {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.lock().unwrap().unavailable = !available;
    }

    pub fn submitted(&self) -> Vec<TaskSpec> {
        self.inner
            .lock()
            .unwrap()
            .submitted
            .iter()
            .map(|(_, spec, _)| spec.clone())
            .collect()
    }

    /// Scripts in submission order.
    pub fn scripts(&self) -> Vec<String> {
        self.submitted().into_iter().map(|s| s.script).collect()
    }

    pub fn submit_times(&self) -> Vec<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .submitted
            .iter()
            .map(|(_, _, at)| *at)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    pub fn polls(&self, task_id: &TaskId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .polls
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    fn status_of(entry: &Entry, now: DateTime<Utc>) -> TaskStatus {
        let spec = &entry.spec;
        let started = entry.submitted_at + secs_param(spec, "delay", 0.0);
        let finished = started + secs_param(spec, "duration", 1.0);

        if let Some(at) = entry.cancelled_at {
            if at < finished {
                let start = (at >= started).then_some(started);
                return TaskStatus::cancelled().with_times(start, Some(at));
            }
        }
        if now < started {
            return TaskStatus::pending();
        }
        if now < finished {
            let total = (finished - started).num_milliseconds().max(1);
            let done = (now - started).num_milliseconds();
            return TaskStatus::running(Some((done * 100 / total) as u8))
                .with_times(Some(started), None);
        }

        let param = |key: &str| spec.params.get(key).and_then(|v| v.as_str());
        let outcome = if entry.fail {
            "failure"
        } else {
            param("outcome").unwrap_or("success")
        };
        let message = param("error")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} failed", spec.script));

        let status = match outcome {
            "failure" => {
                let status = TaskStatus::failure(message);
                match param("code") {
                    Some(code) => status.with_code(code),
                    None => status,
                }
            }
            "timeout" => TaskStatus::timeout(message),
            _ => TaskStatus::success(
                spec.params
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| json!({ "script": spec.script })),
            ),
        };
        status.with_times(Some(started), Some(finished))
    }
}

#[async_trait]
impl TaskQueue for ScriptedQueue {
    async fn submit(&self, spec: &TaskSpec) -> Result<TaskId, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(QueueError::Unavailable("broker connection refused".to_string()));
        }
        inner.next_id += 1;
        let task_id = TaskId::new(format!("task-{}", inner.next_id));
        let now = self.clock.now();

        let attempt = inner.attempts.entry(spec.script.clone()).or_default();
        *attempt += 1;
        let fail_times = spec.params.get("fail_times").and_then(|v| v.as_u64()).unwrap_or(0);
        let fail = *attempt <= fail_times;

        inner.submitted.push((task_id.clone(), spec.clone(), now));
        inner.tasks.insert(
            task_id.clone(),
            Entry {
                spec: spec.clone(),
                submitted_at: now,
                fail,
                cancelled_at: None,
            },
        );
        Ok(task_id)
    }

    async fn poll(&self, task_id: &TaskId) -> Result<TaskStatus, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.polls.entry(task_id.clone()).or_default() += 1;
        let entry = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.clone()))?;
        Ok(Self::status_of(entry, self.clock.now()))
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.clone()))?;
        if Self::status_of(entry, now).is_terminal() {
            return Ok(false);
        }
        entry.cancelled_at = Some(now);
        inner.cancelled.push(task_id.clone());
        Ok(true)
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::from_secs(1),
        task_timeout: Duration::from_secs(600),
        batch_size: 2,
    }
}

pub fn pipeline(queue: Arc<ScriptedQueue>, clock: Arc<ManualClock>) -> TaskPipeline {
    TaskPipeline::new(queue, clock, pipeline_config())
}

/// Everything an executor test needs, all on one manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub queue: Arc<ScriptedQueue>,
    pub pipeline: Arc<TaskPipeline>,
    pub router: Arc<WorkflowRouter>,
    pub breakers: Arc<simcore::CircuitBreakerRegistry>,
    pub metrics: Arc<simcore::ExecutionMetricsStore>,
}

impl Harness {
    pub fn new(router_config: RouterConfig) -> Self {
        let clock = manual_clock();
        let queue = Arc::new(ScriptedQueue::new(clock.clone()));
        let pipeline = Arc::new(pipeline(queue.clone(), clock.clone()));
        let breakers = Arc::new(simcore::CircuitBreakerRegistry::new());
        let router = Arc::new(WorkflowRouter::new(router_config, breakers.clone(), clock.clone()));
        Self {
            clock,
            queue,
            pipeline,
            router,
            breakers,
            metrics: Arc::new(simcore::ExecutionMetricsStore::new()),
        }
    }

    pub fn executor(&self, config: ExecutorConfig) -> WorkflowExecutor {
        WorkflowExecutor::new(
            self.pipeline.clone(),
            self.router.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            config,
        )
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}
