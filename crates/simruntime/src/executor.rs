use crate::pipeline::TaskPipeline;
use crate::router::WorkflowRouter;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::Serialize;
use simcore::{
    Clock, ErrorRecord, EventBus, ExecutionEvent, ExecutionId, ExecutionMetricsStore, JoinMode,
    ParallelSplit, PipelineError, ResourceProfiler, RoutingDecision, RoutingStrategy, StepSpec,
    Target, TaskId, TaskStatus, WorkflowError, WorkflowGraph, WorkflowState,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard cap on executed steps per run, retries and branches included.
    pub max_iterations: u32,
    pub default_step_timeout: Duration,
    /// Used when the graph doesn't set `max_retries`.
    pub default_max_retries: u32,
    pub cancel_on_timeout: bool,
    /// Cancel the remaining branches once an any-mode join is satisfied.
    pub cancel_losers: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            default_step_timeout: Duration::from_secs(3600),
            default_max_retries: 3,
            cancel_on_timeout: true,
            cancel_losers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed,
    Failed { step: String, reason: String },
    IterationCapReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteRecord {
    pub step: String,
    pub decision: RoutingDecision,
}

/// Result of one workflow run. The final state carries the full error list
/// and the retry / breaker counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub execution_id: ExecutionId,
    pub workflow: String,
    pub outcome: WorkflowOutcome,
    pub iterations: u32,
    pub path: Vec<String>,
    pub routes: Vec<RouteRecord>,
    pub state: WorkflowState,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.outcome == WorkflowOutcome::Completed
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.state.errors
    }
}

/// Check a graph before running it and build its step graph.
///
/// Fails on duplicate step names, a missing start step, or an edge naming a
/// step that doesn't exist. Steps unreachable from the start are only logged.
pub fn validate_graph(graph: &WorkflowGraph) -> Result<DiGraph<String, ()>, WorkflowError> {
    if graph.steps.is_empty() {
        return Err(WorkflowError::Invalid(format!(
            "workflow '{}' has no steps",
            graph.name
        )));
    }

    let mut dag = DiGraph::new();
    let mut index: HashMap<String, NodeIndex> = HashMap::new();
    for step in &graph.steps {
        let idx = dag.add_node(step.name.clone());
        if index.insert(step.name.clone(), idx).is_some() {
            return Err(WorkflowError::DuplicateStep(step.name.clone()));
        }
    }

    let start = *index
        .get(&graph.start)
        .ok_or_else(|| WorkflowError::StepNotFound(graph.start.clone()))?;

    for step in &graph.steps {
        let from = index[&step.name];
        for target in step.edges.targets() {
            let to = index
                .get(target)
                .ok_or_else(|| WorkflowError::UnknownTarget {
                    step: step.name.clone(),
                    target: target.to_string(),
                })?;
            dag.update_edge(from, *to, ());
        }
    }

    let mut reachable = HashSet::new();
    let mut bfs = Bfs::new(&dag, start);
    while let Some(idx) = bfs.next(&dag) {
        reachable.insert(idx);
    }
    for idx in dag.node_indices().filter(|idx| !reachable.contains(idx)) {
        warn!(workflow = %graph.name, step = %dag[idx], "Step is unreachable from start");
    }

    Ok(dag)
}

fn is_failure_route(strategy: RoutingStrategy) -> bool {
    matches!(
        strategy,
        RoutingStrategy::CircuitBreaker | RoutingStrategy::RetryBackoff | RoutingStrategy::ErrorSeverity
    )
}

/// Tracks the branches of one fan-out until the join can proceed.
struct JoinBarrier {
    join: String,
    mode: JoinMode,
    total: usize,
    pending: Vec<String>,
    succeeded: Vec<String>,
    failed: Vec<(String, RoutingDecision)>,
    backoff: Duration,
}

impl JoinBarrier {
    fn new(split: &ParallelSplit, branches: Vec<String>) -> Self {
        Self {
            join: split.join.clone(),
            mode: split.mode,
            total: branches.len(),
            pending: branches,
            succeeded: Vec::new(),
            failed: Vec::new(),
            backoff: Duration::ZERO,
        }
    }

    /// A retried branch stays pending; anything else leaves the barrier.
    fn arrive(&mut self, branch: &str, decision: RoutingDecision) {
        if decision.strategy == RoutingStrategy::RetryBackoff && decision.next.step_name() == Some(branch) {
            self.backoff = self.backoff.max(decision.backoff().unwrap_or_default());
            return;
        }
        self.pending.retain(|b| b != branch);
        if is_failure_route(decision.strategy) {
            self.failed.push((branch.to_string(), decision));
        } else {
            self.succeeded.push(branch.to_string());
        }
    }

    fn is_satisfied(&self) -> bool {
        match self.mode {
            JoinMode::All => self.succeeded.len() == self.total,
            JoinMode::Any => !self.succeeded.is_empty(),
        }
    }

    /// First failure that makes the join unreachable.
    fn broken(&self) -> Option<&(String, RoutingDecision)> {
        let unreachable = match self.mode {
            JoinMode::All => !self.failed.is_empty(),
            JoinMode::Any => self.pending.is_empty() && self.succeeded.is_empty(),
        };
        unreachable.then(|| self.failed.first()).flatten()
    }

    fn take_backoff(&mut self) -> Duration {
        std::mem::take(&mut self.backoff)
    }
}

enum JoinOutcome {
    Proceed { step: String, decision: RoutingDecision },
    CapReached,
}

/// A step whose task was submitted and still has to be awaited.
struct InFlight<'a> {
    step: &'a StepSpec,
    task_id: TaskId,
    began: DateTime<Utc>,
}

/// Drives a workflow graph: runs the current step through the pipeline,
/// records the outcome, asks the router where to go next.
pub struct WorkflowExecutor {
    pipeline: Arc<TaskPipeline>,
    router: Arc<WorkflowRouter>,
    metrics: Arc<ExecutionMetricsStore>,
    profiler: Option<Arc<dyn ResourceProfiler>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        pipeline: Arc<TaskPipeline>,
        router: Arc<WorkflowRouter>,
        metrics: Arc<ExecutionMetricsStore>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pipeline,
            router,
            metrics,
            profiler: None,
            clock,
            events: EventBus::default(),
            config,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Refresh `state.resources` from the profiler before every step.
    pub fn with_profiler(mut self, profiler: Arc<dyn ResourceProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute(&self, graph: &WorkflowGraph) -> Result<WorkflowReport, WorkflowError> {
        self.execute_with_context(graph, serde_json::Map::new()).await
    }

    /// Run with extra context entries layered over the graph's own.
    pub async fn execute_with_context(
        &self,
        graph: &WorkflowGraph,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<WorkflowReport, WorkflowError> {
        let max_retries = graph.max_retries.unwrap_or(self.config.default_max_retries);
        let mut state = WorkflowState::new(max_retries);
        state.context = graph.context.clone();
        state.context.extend(context);
        self.execute_with_state(graph, state).await
    }

    pub async fn execute_with_state(
        &self,
        graph: &WorkflowGraph,
        mut state: WorkflowState,
    ) -> Result<WorkflowReport, WorkflowError> {
        validate_graph(graph)?;

        let execution_id = ExecutionId::new_v4();
        let started = self.clock.now();
        info!(%execution_id, workflow = %graph.name, start = %graph.start, "Starting workflow");
        self.events.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow: graph.name.clone(),
            timestamp: started,
        });

        for (step, metrics) in self.metrics.snapshot() {
            state.execution_metrics.entry(step).or_insert(metrics);
        }

        let mut routes = Vec::new();
        let mut current = Target::step(&graph.start);
        let mut last = (graph.start.clone(), String::new());

        let outcome = loop {
            let name = match &current {
                Target::Complete => break WorkflowOutcome::Completed,
                Target::Abort => {
                    break WorkflowOutcome::Failed {
                        step: last.0.clone(),
                        reason: last.1.clone(),
                    }
                }
                Target::Step(name) => name.clone(),
            };
            let step = graph
                .find_step(&name)
                .ok_or_else(|| WorkflowError::StepNotFound(name.clone()))?;

            if state.iterations >= self.config.max_iterations {
                warn!(%execution_id, step = %name, cap = self.config.max_iterations, "Iteration cap reached");
                break WorkflowOutcome::IterationCapReached;
            }

            let mut decision = self.step_decision(execution_id, step, &mut state).await;
            self.note_route(execution_id, &step.name, &decision, &mut routes);
            last = (step.name.clone(), decision.reason.clone());

            if let Some(split) = decision.split.clone() {
                match self
                    .fan_out(execution_id, graph, &split, &mut state, &mut routes)
                    .await?
                {
                    JoinOutcome::Proceed { step, decision: joined } => {
                        last = (step, joined.reason.clone());
                        decision = joined;
                    }
                    JoinOutcome::CapReached => break WorkflowOutcome::IterationCapReached,
                }
            }

            if let Some(backoff) = decision.backoff() {
                debug!(step = %step.name, ?backoff, "Sleeping before retry");
                self.clock.sleep(backoff).await;
            }
            current = decision.next;
        };

        let finished = self.clock.now();
        let duration_ms = (finished - started).num_milliseconds().max(0) as u64;
        let success = outcome == WorkflowOutcome::Completed;
        match &outcome {
            WorkflowOutcome::Completed => {
                info!(%execution_id, workflow = %graph.name, iterations = state.iterations, duration_ms, "Workflow completed")
            }
            WorkflowOutcome::Failed { step, reason } => error!(
                %execution_id,
                workflow = %graph.name,
                step = %step,
                reason = %reason,
                errors = state.errors.len(),
                retries = state.total_retries(),
                failures = state.failure_count,
                "Workflow failed"
            ),
            WorkflowOutcome::IterationCapReached => {
                warn!(%execution_id, workflow = %graph.name, iterations = state.iterations, "Workflow stopped at iteration cap")
            }
        }
        self.events.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            success,
            iterations: state.iterations,
            duration_ms,
            timestamp: finished,
        });

        Ok(WorkflowReport {
            execution_id,
            workflow: graph.name.clone(),
            outcome,
            iterations: state.iterations,
            path: state.path.clone(),
            routes,
            state,
        })
    }

    fn begin_step(&self, step: &StepSpec, state: &mut WorkflowState) {
        state.iterations += 1;
        state.path.push(step.name.clone());
        if let Some(profiler) = &self.profiler {
            state.resources = profiler.snapshot();
        }
    }

    async fn step_decision(
        &self,
        execution_id: ExecutionId,
        step: &StepSpec,
        state: &mut WorkflowState,
    ) -> RoutingDecision {
        self.begin_step(step, state);
        if let Some(decision) = self.router.precheck(state, &step.name, &step.edges) {
            info!(step = %step.name, next = %decision.next, "Skipping step, circuit open");
            return decision;
        }

        let began = self.clock.now();
        let status = match self.submit_step(execution_id, step, state.retries(&step.name) + 1).await {
            Ok(task_id) => self.await_step(step, &task_id).await,
            Err(status) => status,
        };
        self.complete_step(execution_id, state, step, status, began);
        self.router.decide(state, &step.name, &step.edges)
    }

    /// Submission failures come back as a transient failure status.
    async fn submit_step(
        &self,
        execution_id: ExecutionId,
        step: &StepSpec,
        attempt: u32,
    ) -> Result<TaskId, TaskStatus> {
        let now = self.clock.now();
        let submitted = self.pipeline.submit(&step.task).await;
        self.events.emit(ExecutionEvent::StepStarted {
            execution_id,
            step: step.name.clone(),
            task_id: submitted.as_ref().ok().cloned(),
            attempt,
            timestamp: now,
        });

        submitted.map_err(|e| {
            warn!(step = %step.name, error = %e, "Step submission failed");
            TaskStatus::failure(e.to_string())
                .with_code("unavailable")
                .with_times(Some(now), Some(now))
        })
    }

    async fn await_step(&self, step: &StepSpec, task_id: &TaskId) -> TaskStatus {
        let timeout = step.timeout().unwrap_or(self.config.default_step_timeout);
        let status = match self.pipeline.wait_for_task(task_id, timeout).await {
            Ok(status) => status,
            Err(PipelineError::Timeout { .. }) => self.expire(step, task_id, timeout).await,
            Err(e) => {
                warn!(step = %step.name, task_id = %task_id, error = %e, "Lost track of step task");
                TaskStatus::failure(e.to_string()).with_code("unavailable")
            }
        };
        // The run keeps the status in its own state from here on.
        self.pipeline.forget(task_id).await;
        status
    }

    async fn expire(&self, step: &StepSpec, task_id: &TaskId, timeout: Duration) -> TaskStatus {
        warn!(step = %step.name, task_id = %task_id, ?timeout, "Step timed out");
        if self.config.cancel_on_timeout {
            if let Err(e) = self.pipeline.cancel_task(task_id).await {
                warn!(task_id = %task_id, error = %e, "Could not cancel timed-out task");
            }
        }
        TaskStatus::timeout(format!(
            "step '{}' timed out after {}s",
            step.name,
            timeout.as_secs()
        ))
        .with_code("timeout")
    }

    fn complete_step(
        &self,
        execution_id: ExecutionId,
        state: &mut WorkflowState,
        step: &StepSpec,
        status: TaskStatus,
        began: DateTime<Utc>,
    ) {
        let now = self.clock.now();
        let duration = status
            .duration()
            .unwrap_or_else(|| (now - began).to_std().unwrap_or_default());
        let success = status.state.is_success();

        if success {
            info!(step = %step.name, ?duration, "Step succeeded");
        } else {
            warn!(step = %step.name, state = %status.state, error = ?status.error, "Step did not succeed");
        }

        self.metrics.record(&step.name, success, duration);
        self.events.emit(ExecutionEvent::StepCompleted {
            execution_id,
            step: step.name.clone(),
            state: status.state,
            duration_ms: duration.as_millis() as u64,
            timestamp: now,
        });
        state.record_outcome(&step.name, status, duration, now);
    }

    fn note_route(
        &self,
        execution_id: ExecutionId,
        step: &str,
        decision: &RoutingDecision,
        routes: &mut Vec<RouteRecord>,
    ) {
        info!(
            step,
            strategy = ?decision.strategy,
            next = %decision.next,
            reason = %decision.reason,
            "Routing decision"
        );
        self.events.emit(ExecutionEvent::RouteDecided {
            execution_id,
            step: step.to_string(),
            strategy: decision.strategy,
            next: decision.next.to_string(),
            reason: decision.reason.clone(),
            timestamp: self.clock.now(),
        });
        routes.push(RouteRecord {
            step: step.to_string(),
            decision: decision.clone(),
        });
    }

    /// Run the branches of a split in rounds until the join is satisfied or
    /// can no longer be reached. Failed branches are retried through the
    /// router like any other step; their own success edges are not followed.
    async fn fan_out(
        &self,
        execution_id: ExecutionId,
        graph: &WorkflowGraph,
        split: &ParallelSplit,
        state: &mut WorkflowState,
        routes: &mut Vec<RouteRecord>,
    ) -> Result<JoinOutcome, WorkflowError> {
        let branches: Vec<String> = self
            .router
            .route_parallel_split(&split.branches, &split.join, split.mode)
            .into_iter()
            .filter_map(|d| d.next.step_name().map(str::to_string))
            .collect();
        info!(join = %split.join, mode = ?split.mode, branches = ?branches, "Fanning out");

        let mut barrier = JoinBarrier::new(split, branches);
        loop {
            if barrier.is_satisfied() {
                info!(join = %barrier.join, succeeded = ?barrier.succeeded, "Join barrier satisfied");
                let decision = RoutingDecision::new(
                    Target::step(&barrier.join),
                    RoutingStrategy::ParallelSplit,
                    format!(
                        "{} of {} branches succeeded, joining at '{}'",
                        barrier.succeeded.len(),
                        barrier.total,
                        barrier.join
                    ),
                )
                .with_join(&barrier.join)
                .with_metadata("succeeded", barrier.succeeded.clone());
                self.note_route(execution_id, &barrier.join, &decision, routes);
                return Ok(JoinOutcome::Proceed {
                    step: barrier.join.clone(),
                    decision,
                });
            }
            if let Some((branch, decision)) = barrier.broken() {
                warn!(join = %barrier.join, branch = %branch, next = %decision.next, "Join barrier broken");
                return Ok(JoinOutcome::Proceed {
                    step: branch.clone(),
                    decision: decision.clone(),
                });
            }
            if barrier.pending.is_empty() {
                // Nothing left to run and neither satisfied nor broken.
                return Err(WorkflowError::Invalid(format!(
                    "parallel split joining at '{}' has no branches",
                    barrier.join
                )));
            }

            let pending = barrier.pending.clone();
            if state.iterations + pending.len() as u32 > self.config.max_iterations {
                warn!(join = %barrier.join, cap = self.config.max_iterations, "Iteration cap reached during fan-out");
                return Ok(JoinOutcome::CapReached);
            }

            let backoff = barrier.take_backoff();
            if !backoff.is_zero() {
                debug!(join = %barrier.join, ?backoff, "Sleeping before branch retry");
                self.clock.sleep(backoff).await;
            }

            let steps = pending
                .iter()
                .map(|name| {
                    graph
                        .find_step(name)
                        .ok_or_else(|| WorkflowError::StepNotFound(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for (branch, decision) in self.run_round(execution_id, &steps, split.mode, state).await {
                self.note_route(execution_id, &branch, &decision, routes);
                barrier.arrive(&branch, decision);
                if split.mode == JoinMode::Any && barrier.is_satisfied() {
                    break;
                }
            }
        }
    }

    /// One attempt of each pending branch. Returns decisions in arrival order.
    async fn run_round<'a>(
        &self,
        execution_id: ExecutionId,
        steps: &[&'a StepSpec],
        mode: JoinMode,
        state: &mut WorkflowState,
    ) -> Vec<(String, RoutingDecision)> {
        let mut decisions = Vec::new();
        let mut in_flight: Vec<InFlight<'a>> = Vec::new();

        for &step in steps {
            self.begin_step(step, state);
            if let Some(decision) = self.router.precheck(state, &step.name, &step.edges) {
                decisions.push((step.name.clone(), decision));
                continue;
            }
            let began = self.clock.now();
            match self.submit_step(execution_id, step, state.retries(&step.name) + 1).await {
                Ok(task_id) => in_flight.push(InFlight {
                    step,
                    task_id,
                    began,
                }),
                Err(status) => {
                    self.complete_step(execution_id, state, step, status, began);
                    decisions.push((step.name.clone(), self.router.decide(state, &step.name, &step.edges)));
                }
            }
        }

        match mode {
            JoinMode::All => {
                let statuses =
                    join_all(in_flight.iter().map(|f| self.await_step(f.step, &f.task_id))).await;
                for (flight, status) in in_flight.iter().zip(statuses) {
                    self.complete_step(execution_id, state, flight.step, status, flight.began);
                    let decision = self.router.decide(state, &flight.step.name, &flight.step.edges);
                    decisions.push((flight.step.name.clone(), decision));
                }
            }
            JoinMode::Any => {
                let succeeded = decisions.iter().any(|(_, d)| !is_failure_route(d.strategy));
                if !succeeded {
                    self.race(execution_id, in_flight, state, &mut decisions).await;
                } else {
                    self.cancel_losers(&in_flight).await;
                }
            }
        }
        decisions
    }

    /// Await branch tasks in completion order until one succeeds.
    async fn race<'a>(
        &self,
        execution_id: ExecutionId,
        mut in_flight: Vec<InFlight<'a>>,
        state: &mut WorkflowState,
        decisions: &mut Vec<(String, RoutingDecision)>,
    ) {
        let timeout = in_flight
            .iter()
            .map(|f| f.step.timeout().unwrap_or(self.config.default_step_timeout))
            .max()
            .unwrap_or(self.config.default_step_timeout);
        let started = self.clock.now();

        while !in_flight.is_empty() {
            let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
            let ids: Vec<TaskId> = in_flight.iter().map(|f| f.task_id.clone()).collect();

            let (finished, status) = match self
                .pipeline
                .wait_for_any(&ids, timeout.saturating_sub(elapsed))
                .await
            {
                Ok((task_id, status)) => {
                    let pos = in_flight.iter().position(|f| f.task_id == task_id).unwrap_or(0);
                    (in_flight.remove(pos), status)
                }
                Err(PipelineError::Timeout { .. }) => {
                    let flight = in_flight.remove(0);
                    let status = self.expire(flight.step, &flight.task_id, timeout).await;
                    (flight, status)
                }
                Err(e) => {
                    let flight = in_flight.remove(0);
                    warn!(step = %flight.step.name, error = %e, "Lost track of branch task");
                    (flight, TaskStatus::failure(e.to_string()).with_code("unavailable"))
                }
            };
            self.pipeline.forget(&finished.task_id).await;

            self.complete_step(execution_id, state, finished.step, status, finished.began);
            let decision = self.router.decide(state, &finished.step.name, &finished.step.edges);
            let won = !is_failure_route(decision.strategy);
            decisions.push((finished.step.name.clone(), decision));
            if won {
                self.cancel_losers(&in_flight).await;
                return;
            }
        }
    }

    async fn cancel_losers(&self, in_flight: &[InFlight<'_>]) {
        for flight in in_flight {
            if self.config.cancel_losers {
                match self.pipeline.cancel_task(&flight.task_id).await {
                    Ok(cancelled) => {
                        debug!(step = %flight.step.name, task_id = %flight.task_id, cancelled, "Cancelled losing branch")
                    }
                    Err(e) => warn!(task_id = %flight.task_id, error = %e, "Could not cancel losing branch"),
                }
            }
            self.pipeline.forget(&flight.task_id).await;
        }
    }
}
