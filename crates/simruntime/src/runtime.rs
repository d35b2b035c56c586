use crate::executor::{ExecutorConfig, WorkflowExecutor, WorkflowReport};
use crate::history::JobMonitor;
use crate::local::LocalQueue;
use crate::pipeline::{default_batch_size, PipelineConfig, TaskPipeline};
use crate::queue::TaskQueue;
use crate::registry::ToolRegistry;
use crate::router::{RouterConfig, WorkflowRouter};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use simcore::{
    CircuitBreakerConfig, CircuitBreakerRegistry, Clock, EventBus, ExecutionEvent,
    ExecutionMetricsStore, ResourceProfiler, SystemClock, WorkflowError, WorkflowGraph,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Wires queue, pipeline, router and executor around one shared metrics
/// store and breaker registry. Workflows run on it concurrently.
pub struct SimRuntime {
    config: RuntimeConfig,
    queue: Arc<dyn TaskQueue>,
    pipeline: Arc<TaskPipeline>,
    router: Arc<WorkflowRouter>,
    executor: Arc<WorkflowExecutor>,
    metrics: Arc<ExecutionMetricsStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: EventBus,
    monitor: Option<Arc<JobMonitor>>,
}

impl SimRuntime {
    /// Runtime over an in-process worker pool running `registry`'s tools.
    pub fn new(config: RuntimeConfig, registry: Arc<ToolRegistry>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(LocalQueue::with_clock(registry, config.workers, clock.clone()));
        Self::with_queue(config, queue, clock)
    }

    /// Runtime over any queue backend, e.g. a remote broker client.
    pub fn with_queue(config: RuntimeConfig, queue: Arc<dyn TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, queue, clock, None)
    }

    pub fn with_profiler(
        config: RuntimeConfig,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        profiler: Arc<dyn ResourceProfiler>,
    ) -> Self {
        Self::build(config, queue, clock, Some(profiler))
    }

    fn build(
        config: RuntimeConfig,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        profiler: Option<Arc<dyn ResourceProfiler>>,
    ) -> Self {
        let events = EventBus::new(config.event_buffer_size);
        let metrics = Arc::new(ExecutionMetricsStore::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let monitor = config.history_path.clone().map(|p| Arc::new(JobMonitor::new(p)));

        let mut pipeline = TaskPipeline::new(queue.clone(), clock.clone(), config.pipeline_config())
            .with_events(events.clone());
        if let Some(monitor) = &monitor {
            pipeline = pipeline.with_monitor(monitor.clone());
        }
        let pipeline = Arc::new(pipeline);

        let router = Arc::new(WorkflowRouter::new(
            config.router_config(),
            breakers.clone(),
            clock.clone(),
        ));

        let mut executor = WorkflowExecutor::new(
            pipeline.clone(),
            router.clone(),
            metrics.clone(),
            clock,
            config.executor_config(),
        )
        .with_events(events.clone());
        if let Some(profiler) = profiler {
            executor = executor.with_profiler(profiler);
        }

        tracing::info!(
            workers = config.workers,
            batch_size = config.batch_size,
            history = ?config.history_path,
            "Runtime ready"
        );

        Self {
            config,
            queue,
            pipeline,
            router,
            executor: Arc::new(executor),
            metrics,
            breakers,
            events,
            monitor,
        }
    }

    pub async fn execute(&self, graph: &WorkflowGraph) -> Result<WorkflowReport, WorkflowError> {
        self.executor.execute(graph).await
    }

    /// Run several workflows concurrently, each with its own state.
    pub async fn run_many(&self, graphs: &[WorkflowGraph]) -> Vec<Result<WorkflowReport, WorkflowError>> {
        join_all(graphs.iter().map(|g| self.executor.execute(g))).await
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<TaskPipeline> {
        &self.pipeline
    }

    pub fn router(&self) -> &Arc<WorkflowRouter> {
        &self.router
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetricsStore> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn monitor(&self) -> Option<&Arc<JobMonitor>> {
        self.monitor.as_ref()
    }

    /// Drop finished tasks from the pipeline and the queue.
    pub async fn purge_finished(&self) -> usize {
        self.pipeline.purge_finished().await
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub poll_interval_ms: u64,
    pub default_timeout_secs: u64,
    pub workers: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
    pub max_iterations: u32,
    pub breaker_threshold: u32,
    pub breaker_reset_secs: u64,
    pub event_buffer_size: usize,
    pub history_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            default_timeout_secs: 3600,
            workers: num_cpus::get().max(1),
            batch_size: default_batch_size(),
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff_secs: 300,
            max_iterations: 100,
            breaker_threshold: 5,
            breaker_reset_secs: 60,
            event_buffer_size: 1000,
            history_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `SIMFLOW_*` environment variables. Values that
    /// don't parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up by variable name.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            let Some(raw) = raw else { return };
            match raw.trim().parse() {
                Ok(value) => *slot = value,
                Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparsable setting"),
            }
        }

        parse("SIMFLOW_POLL_INTERVAL_MS", lookup("SIMFLOW_POLL_INTERVAL_MS"), &mut self.poll_interval_ms);
        parse("SIMFLOW_TIMEOUT_SECS", lookup("SIMFLOW_TIMEOUT_SECS"), &mut self.default_timeout_secs);
        parse("SIMFLOW_WORKERS", lookup("SIMFLOW_WORKERS"), &mut self.workers);
        parse("SIMFLOW_BATCH_SIZE", lookup("SIMFLOW_BATCH_SIZE"), &mut self.batch_size);
        parse("SIMFLOW_MAX_RETRIES", lookup("SIMFLOW_MAX_RETRIES"), &mut self.max_retries);
        parse("SIMFLOW_BACKOFF_MULTIPLIER", lookup("SIMFLOW_BACKOFF_MULTIPLIER"), &mut self.backoff_multiplier);
        parse("SIMFLOW_MAX_BACKOFF_SECS", lookup("SIMFLOW_MAX_BACKOFF_SECS"), &mut self.max_backoff_secs);
        parse("SIMFLOW_MAX_ITERATIONS", lookup("SIMFLOW_MAX_ITERATIONS"), &mut self.max_iterations);
        parse("SIMFLOW_BREAKER_THRESHOLD", lookup("SIMFLOW_BREAKER_THRESHOLD"), &mut self.breaker_threshold);
        parse("SIMFLOW_BREAKER_RESET_SECS", lookup("SIMFLOW_BREAKER_RESET_SECS"), &mut self.breaker_reset_secs);
        parse("SIMFLOW_EVENT_BUFFER", lookup("SIMFLOW_EVENT_BUFFER"), &mut self.event_buffer_size);
        if let Some(path) = lookup("SIMFLOW_HISTORY_PATH").filter(|p| !p.trim().is_empty()) {
            self.history_path = Some(PathBuf::from(path));
        }
        self
    }

    pub fn with_history(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            task_timeout: Duration::from_secs(self.default_timeout_secs),
            batch_size: self.batch_size.max(1),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            circuit: CircuitBreakerConfig {
                threshold: self.breaker_threshold.max(1),
                reset_after: Duration::from_secs(self.breaker_reset_secs),
            },
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_iterations: self.max_iterations,
            default_step_timeout: Duration::from_secs(self.default_timeout_secs),
            default_max_retries: self.max_retries,
            ..ExecutorConfig::default()
        }
    }
}
