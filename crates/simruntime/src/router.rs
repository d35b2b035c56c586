//! Routing decisions after each workflow step.
//!
//! [`WorkflowRouter::decide`] evaluates the strategies in a fixed order:
//!
//! 1. circuit breaker open → fallback
//! 2. success → the step's success route (next / conditional / priority /
//!    resource / adaptive / parallel)
//! 3. retryable failure with retries left → same step after a backoff
//! 4. otherwise → severity routing (error edge, fallback, continuation)
//!
//! A decision depends only on the [`WorkflowState`] passed in and the step's
//! edges. The router's own side effects are the counters it owns: the retry
//! count, the per-run execution metrics and the shared circuit breakers.

use simcore::{
    CircuitBreakerConfig, CircuitBreakerRegistry, Clock, ContextRule, ErrorKind, ErrorRecord,
    ExecutionMetrics, JoinMode, MetricKind, ParallelSplit, ResourceKind, RoutingDecision,
    RoutingStrategy, Severity, StepEdges, SuccessRoute, Target, TaskState, WorkflowState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub backoff_multiplier: f64,
    /// Upper bound applied to computed backoff delays.
    pub max_backoff: Duration,
    /// Breaker settings for steps that don't declare their own.
    pub circuit: CircuitBreakerConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// `multiplier ^ retry_count` seconds.
pub fn backoff_seconds(multiplier: f64, retry_count: u32) -> f64 {
    multiplier.powi(retry_count as i32)
}

pub struct WorkflowRouter {
    config: RouterConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    clock: Arc<dyn Clock>,
}

impl WorkflowRouter {
    pub fn new(config: RouterConfig, breakers: Arc<CircuitBreakerRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            breakers,
            clock,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn circuit_config(&self, edges: &StepEdges) -> CircuitBreakerConfig {
        edges.circuit.unwrap_or(self.config.circuit)
    }

    /// Checked before a step runs. Returns a fallback decision when the
    /// step's breaker rejects the call.
    pub fn precheck(
        &self,
        state: &mut WorkflowState,
        step: &str,
        edges: &StepEdges,
    ) -> Option<RoutingDecision> {
        let now = self.clock.now();
        if self.breakers.try_acquire(step, self.circuit_config(edges), now) {
            return None;
        }
        if let Some(breaker) = self.breakers.get(step) {
            state.failure_count = breaker.failure_count;
        }
        state.circuit_breaker_open = true;
        Some(self.route_circuit_open(state, step, edges))
    }

    /// Pick the next step after `step` reached a terminal status.
    pub fn decide(&self, state: &mut WorkflowState, step: &str, edges: &StepEdges) -> RoutingDecision {
        let status = state.statuses.get(step).cloned();
        let state_of_step = status.as_ref().map(|s| s.state);
        let success = state_of_step == Some(TaskState::Success);

        if !state_of_step.is_some_and(|s| s.is_terminal()) {
            warn!(step, "Routing a step without a terminal status");
            let now = self.clock.now();
            state.errors.push(ErrorRecord::classify(
                step,
                "step did not reach a terminal state",
                None,
                now,
            ));
        }

        self.record_outcome(state, step, edges, success);

        if state.circuit_breaker_open {
            return self.route_circuit_open(state, step, edges);
        }

        if success {
            state.reset_retries(step);
            return self.route_success(state, step, &edges.on_success);
        }

        let (kind, severity) = state
            .last_error(step)
            .map(|e| (e.kind, e.severity))
            .unwrap_or((ErrorKind::Unknown, Severity::High));

        // Only a failed or timed-out attempt is worth repeating.
        let failed = state_of_step.is_some_and(|s| s.is_failure());
        if failed && edges.retry && kind.is_retryable() && state.retries(step) < state.max_retries {
            return self.route_retry(state, step, kind);
        }

        self.route_by_severity(state, step, edges, kind, severity)
    }

    fn record_outcome(&self, state: &mut WorkflowState, step: &str, edges: &StepEdges, success: bool) {
        let duration = state.durations.get(step).copied().unwrap_or_default();
        state
            .execution_metrics
            .entry(step.to_string())
            .or_insert_with(ExecutionMetrics::default)
            .record(success, duration);

        let breaker = self
            .breakers
            .record(step, self.circuit_config(edges), success, self.clock.now());
        state.circuit_breaker_open = breaker.is_open();
        state.failure_count = breaker.failure_count;
    }

    fn route_circuit_open(&self, state: &WorkflowState, step: &str, edges: &StepEdges) -> RoutingDecision {
        let (next, rest) = match edges.fallbacks.split_first() {
            Some((first, rest)) => (Target::step(first), rest.to_vec()),
            None => (
                edges.on_error.as_ref().map(Target::step).unwrap_or(Target::Abort),
                Vec::new(),
            ),
        };
        warn!(step, next = %next, failures = state.failure_count, "Circuit breaker open");
        RoutingDecision::new(
            next,
            RoutingStrategy::CircuitBreaker,
            format!(
                "circuit breaker for '{}' is open after {} consecutive failures",
                step, state.failure_count
            ),
        )
        .with_metadata("failure_count", state.failure_count)
        .with_fallbacks(rest)
    }

    fn route_retry(&self, state: &mut WorkflowState, step: &str, kind: ErrorKind) -> RoutingDecision {
        let attempt = state.retries(step);
        let backoff = backoff_seconds(self.config.backoff_multiplier, attempt)
            .min(self.config.max_backoff.as_secs_f64());
        let retries = state.note_retry(step);

        info!(step, retry = retries, max = state.max_retries, backoff, "Retrying step");
        RoutingDecision::new(
            Target::step(step),
            RoutingStrategy::RetryBackoff,
            format!(
                "retry {}/{} after {:?} error",
                retries, state.max_retries, kind
            ),
        )
        .with_metadata("backoff_seconds", backoff)
        .with_metadata("retry_count", retries)
        .with_metadata("max_retries", state.max_retries)
    }

    fn route_by_severity(
        &self,
        state: &WorkflowState,
        step: &str,
        edges: &StepEdges,
        kind: ErrorKind,
        severity: Severity,
    ) -> RoutingDecision {
        let error_edge = || edges.on_error.as_ref().map(Target::step).unwrap_or(Target::Abort);
        let fallback = || {
            edges
                .fallbacks
                .split_first()
                .map(|(first, rest)| (Target::step(first), rest.to_vec()))
        };

        let (next, rest, reason) = match severity {
            Severity::Critical => (error_edge(), Vec::new(), "critical error"),
            Severity::High => match fallback() {
                Some((next, rest)) => (next, rest, "high severity error, using fallback"),
                None => (error_edge(), Vec::new(), "high severity error"),
            },
            Severity::Low | Severity::Medium => {
                if let Some(cont) = &edges.continuation {
                    warn!(step, %severity, "Continuing past failed step");
                    (Target::step(cont), Vec::new(), "continuing with a warning")
                } else if let Some((next, rest)) = fallback() {
                    (next, rest, "recoverable error, using fallback")
                } else {
                    (error_edge(), Vec::new(), "recoverable error with no continuation")
                }
            }
        };

        if next == Target::Abort {
            warn!(step, %severity, retries = state.retries(step), "Step failure is terminal");
        }

        let message = state
            .last_error(step)
            .map(|e| e.message.clone())
            .unwrap_or_default();

        RoutingDecision::new(
            next,
            RoutingStrategy::ErrorSeverity,
            format!("{} in '{}': {}", reason, step, message),
        )
        .with_metadata("severity", severity.to_string())
        .with_metadata("error_kind", format!("{:?}", kind))
        .with_metadata("retry_count", state.retries(step))
        .with_metadata("failure_count", state.failure_count)
        .with_metadata("error_count", state.errors.len())
        .with_fallbacks(rest)
    }

    fn route_success(&self, state: &WorkflowState, step: &str, route: &SuccessRoute) -> RoutingDecision {
        let duration = state.durations.get(step).copied().unwrap_or_default();
        let decision = match route {
            SuccessRoute::Next { target } => RoutingDecision::new(
                target.clone(),
                RoutingStrategy::Success,
                format!("'{}' succeeded", step),
            ),
            SuccessRoute::Conditional {
                field,
                routes,
                default,
            } => self.route_conditional(state, step, field, routes, default),
            SuccessRoute::Priority { rules, default } => self.route_priority(state, rules, default),
            SuccessRoute::Resource {
                resource,
                threshold,
                intensive,
                lightweight,
            } => self.route_resource(state, *resource, *threshold, intensive, lightweight),
            SuccessRoute::Adaptive { candidates, metric } => {
                self.route_adaptive(state, candidates, *metric)
            }
            SuccessRoute::Parallel {
                branches,
                join,
                mode,
            } => RoutingDecision::new(
                Target::step(join),
                RoutingStrategy::ParallelSplit,
                format!("fan out to {} branches, join at '{}'", branches.len(), join),
            )
            .with_split(ParallelSplit {
                branches: branches.clone(),
                join: join.clone(),
                mode: *mode,
            }),
        };
        debug!(step, strategy = ?decision.strategy, next = %decision.next, "Success route");
        decision.with_metadata("duration_seconds", duration.as_secs_f64())
    }

    /// Route on a field of the step's result payload. `field` may be a dotted
    /// path into nested objects.
    pub fn route_conditional(
        &self,
        state: &WorkflowState,
        step: &str,
        field: &str,
        routes: &BTreeMap<String, Target>,
        default: &Target,
    ) -> RoutingDecision {
        let value = state
            .results
            .get(step)
            .and_then(|result| field.split('.').try_fold(result, |v, key| v.get(key)));
        let key = value.map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        let (next, matched) = match key.as_ref().and_then(|k| routes.get(k)) {
            Some(target) => (target.clone(), true),
            None => (default.clone(), false),
        };

        RoutingDecision::new(
            next,
            RoutingStrategy::Conditional,
            match (&key, matched) {
                (Some(k), true) => format!("{} = {}", field, k),
                (Some(k), false) => format!("{} = {} is unmapped, using default", field, k),
                (None, _) => format!("{} missing from result, using default", field),
            },
        )
        .with_metadata("field", field)
        .with_metadata("value", value.cloned().unwrap_or(serde_json::Value::Null))
    }

    /// First rule whose predicate holds for the workflow context.
    pub fn route_priority(&self, state: &WorkflowState, rules: &[ContextRule], default: &Target) -> RoutingDecision {
        let matched = rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.predicate.matches(state.context.get(&rule.key)));

        match matched {
            Some((index, rule)) => RoutingDecision::new(
                rule.target.clone(),
                RoutingStrategy::Priority,
                format!("context rule #{} on '{}' matched", index, rule.key),
            )
            .with_metadata("rule", index)
            .with_metadata("key", rule.key.clone()),
            None => RoutingDecision::new(
                default.clone(),
                RoutingStrategy::Priority,
                "no context rule matched, using default",
            ),
        }
    }

    /// Intensive edge when available capacity exceeds the threshold.
    pub fn route_resource(
        &self,
        state: &WorkflowState,
        resource: ResourceKind,
        threshold: f64,
        intensive: &Target,
        lightweight: &Target,
    ) -> RoutingDecision {
        let available = state.resources.available(resource);
        let (next, label) = if available > threshold {
            (intensive.clone(), "intensive")
        } else {
            (lightweight.clone(), "lightweight")
        };

        RoutingDecision::new(
            next,
            RoutingStrategy::ResourceAware,
            format!(
                "{} available {:.2} vs threshold {:.2}, choosing {} path",
                resource, available, threshold, label
            ),
        )
        .with_metadata("resource", resource.to_string())
        .with_metadata("available", available)
        .with_metadata("threshold", threshold)
        .with_metadata("path", label)
    }

    /// Best candidate by `metric`; ties go to the least executed candidate,
    /// then to declaration order.
    pub fn route_adaptive(&self, state: &WorkflowState, candidates: &[String], metric: MetricKind) -> RoutingDecision {
        let unsampled = ExecutionMetrics::default();
        let best = candidates.iter().min_by(|a, b| {
            let ma = state.execution_metrics.get(*a).unwrap_or(&unsampled);
            let mb = state.execution_metrics.get(*b).unwrap_or(&unsampled);
            metric.compare(ma, mb)
        });

        let Some(best) = best else {
            return RoutingDecision::new(
                Target::Abort,
                RoutingStrategy::Adaptive,
                "no candidates for adaptive routing",
            );
        };

        let metrics = state.execution_metrics.get(best).unwrap_or(&unsampled);
        RoutingDecision::new(
            Target::step(best),
            RoutingStrategy::Adaptive,
            format!("'{}' has the best {:?} among {} candidates", best, metric, candidates.len()),
        )
        .with_metadata("metric_value", metric.value(metrics))
        .with_metadata("execution_count", metrics.execution_count)
    }

    /// One decision per branch, all sharing the join target.
    pub fn route_parallel_split(&self, branches: &[String], join: &str, mode: JoinMode) -> Vec<RoutingDecision> {
        let total = branches.len();
        branches
            .iter()
            .enumerate()
            .map(|(index, branch)| {
                RoutingDecision::new(
                    Target::step(branch),
                    RoutingStrategy::ParallelSplit,
                    format!("branch {}/{} of split joining at '{}'", index + 1, total, join),
                )
                .with_join(join)
                .with_metadata("join_mode", serde_json::to_value(mode).unwrap_or_default())
            })
            .collect()
    }
}
