use chrono::{TimeZone, Utc};
use serde_json::json;
use simcore::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Clock, ErrorKind,
    ErrorRecord, EventBus, ExecutionEvent, ExecutionMetrics, ExecutionMetricsStore, ManualClock,
    MetricKind, Predicate, ResourceKind, ResourceSnapshot, Severity, SuccessRoute, Target, Task,
    TaskId, TaskSpec, TaskState, TaskStatus, WorkflowGraph, WorkflowState,
};
use std::cmp::Ordering;
use std::time::Duration;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

fn breaker_config(threshold: u32, reset_secs: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        threshold,
        reset_after: Duration::from_secs(reset_secs),
    }
}

#[test]
fn test_breaker_opens_exactly_at_threshold() {
    let mut breaker = CircuitBreaker::new(breaker_config(3, 60));
    let now = t0();

    breaker.record_failure(now);
    breaker.record_failure(now);
    assert_eq!(breaker.state_at(now), CircuitState::Closed);
    assert!(breaker.try_acquire(now));

    breaker.record_failure(now);
    assert_eq!(breaker.state_at(now), CircuitState::Open);
    assert!(!breaker.try_acquire(now));
}

#[test]
fn test_breaker_success_resets_consecutive_failures() {
    let mut breaker = CircuitBreaker::new(breaker_config(3, 60));
    let now = t0();

    breaker.record_failure(now);
    breaker.record_failure(now);
    breaker.record_success();
    assert_eq!(breaker.failure_count, 0);

    breaker.record_failure(now);
    breaker.record_failure(now);
    assert_eq!(breaker.state_at(now), CircuitState::Closed);
}

#[test]
fn test_breaker_half_open_admits_one_trial() {
    let mut breaker = CircuitBreaker::new(breaker_config(1, 30));
    breaker.record_failure(t0());
    assert!(!breaker.try_acquire(t0() + secs(29)));

    let later = t0() + secs(30);
    assert_eq!(breaker.state_at(later), CircuitState::HalfOpen);
    assert!(breaker.try_acquire(later));
    assert!(!breaker.try_acquire(later), "second trial must wait for the first");

    breaker.record_success();
    assert_eq!(breaker.state_at(later), CircuitState::Closed);
    assert!(breaker.try_acquire(later));
}

#[test]
fn test_breaker_half_open_failure_reopens_with_fresh_timer() {
    let mut breaker = CircuitBreaker::new(breaker_config(1, 30));
    breaker.record_failure(t0());

    let trial = t0() + secs(45);
    assert!(breaker.try_acquire(trial));
    breaker.record_failure(trial);
    assert_eq!(breaker.state_at(trial + secs(29)), CircuitState::Open);
    assert_eq!(breaker.state_at(trial + secs(30)), CircuitState::HalfOpen);
}

#[test]
fn test_registry_keys_breakers_by_step() {
    let registry = CircuitBreakerRegistry::new();
    let config = breaker_config(2, 60);
    let now = t0();

    registry.record("solve", config, false, now);
    let breaker = registry.record("solve", config, false, now);
    assert!(breaker.is_open());
    assert!(!registry.try_acquire("solve", config, now));
    assert!(registry.try_acquire("mesh", config, now));
    assert_eq!(registry.state("mesh", now), Some(CircuitState::Closed));
    assert_eq!(registry.state("unknown", now), None);
}

#[test]
fn test_metrics_success_rate_and_average() {
    let mut metrics = ExecutionMetrics::default();
    assert_eq!(metrics.success_rate(), 1.0);
    assert_eq!(metrics.avg_duration(), Duration::ZERO);

    metrics.record(true, Duration::from_secs(10));
    metrics.record(false, Duration::from_secs(20));
    metrics.record(true, Duration::from_secs(30));
    metrics.record(true, Duration::from_secs(40));

    assert_eq!(metrics.execution_count, 4);
    assert_eq!(metrics.failure_count, 1);
    assert!((metrics.success_rate() - 0.75).abs() < 1e-9);
    assert_eq!(metrics.avg_duration(), Duration::from_secs(25));
}

#[test]
fn test_metric_compare_prefers_better_then_less_sampled() {
    let mut reliable = ExecutionMetrics::default();
    reliable.record(true, Duration::from_secs(50));
    let mut flaky = ExecutionMetrics::default();
    flaky.record(true, Duration::from_secs(5));
    flaky.record(false, Duration::from_secs(5));

    assert_eq!(MetricKind::SuccessRate.compare(&reliable, &flaky), Ordering::Less);
    assert_eq!(MetricKind::AvgDuration.compare(&flaky, &reliable), Ordering::Less);

    let mut busy = ExecutionMetrics::default();
    busy.record(true, Duration::from_secs(1));
    busy.record(true, Duration::from_secs(1));
    assert_eq!(MetricKind::SuccessRate.compare(&reliable, &busy), Ordering::Less);
}

#[test]
fn test_metrics_store_is_shared_by_step() {
    let store = ExecutionMetricsStore::new();
    store.record("solve", true, Duration::from_secs(2));
    store.record("solve", false, Duration::from_secs(4));

    let solve = store.get("solve").unwrap();
    assert_eq!(solve.execution_count, 2);
    assert!(store.get("mesh").is_none());
    assert_eq!(store.snapshot().len(), 1);
}

#[test]
fn test_error_classification() {
    let cases = [
        ("connection reset by peer", None, ErrorKind::Transient, Severity::Low),
        ("solver did not converge", None, ErrorKind::Validation, Severity::Medium),
        ("CUDA error: out of memory", None, ErrorKind::ResourceExhaustion, Severity::High),
        ("missing required parameter: mesh", None, ErrorKind::Configuration, Severity::Critical),
        ("segmentation fault", None, ErrorKind::Fatal, Severity::Critical),
        ("something odd", None, ErrorKind::Unknown, Severity::High),
        ("exit status 1", Some("timeout"), ErrorKind::Transient, Severity::Low),
        ("killed", Some("137"), ErrorKind::ResourceExhaustion, Severity::High),
    ];

    for (message, code, kind, severity) in cases {
        let classified = ErrorKind::classify(message, code);
        assert_eq!(classified, kind, "classifying {:?}", message);
        assert_eq!(classified.severity(), severity, "severity of {:?}", message);
    }
}

#[test]
fn test_retry_eligibility_by_kind() {
    assert!(ErrorKind::Transient.is_retryable());
    assert!(ErrorKind::Validation.is_retryable());
    assert!(!ErrorKind::Configuration.is_retryable());
    assert!(!ErrorKind::Fatal.is_retryable());
    assert!(!ErrorKind::ResourceExhaustion.is_retryable());
}

#[test]
fn test_workflow_state_records_outcomes() {
    let mut state = WorkflowState::new(3);
    state.record_outcome(
        "mesh",
        TaskStatus::success(json!({"cells": 1024})),
        Duration::from_secs(3),
        t0(),
    );
    state.record_outcome(
        "solve",
        TaskStatus::timeout("no answer"),
        Duration::from_secs(60),
        t0(),
    );

    assert_eq!(state.results["mesh"], json!({"cells": 1024}));
    assert!(!state.results.contains_key("solve"));
    assert_eq!(state.status("solve").map(|s| s.state), Some(TaskState::Timeout));

    let error: &ErrorRecord = state.last_error("solve").unwrap();
    assert_eq!(error.code.as_deref(), Some("timeout"));
    assert_eq!(error.kind, ErrorKind::Transient);
    assert_eq!(state.durations["solve"], Duration::from_secs(60));
}

#[test]
fn test_task_terminal_status_is_sticky() {
    let id = TaskId::new("task-1");
    let mut task = Task::new(id, TaskSpec::new("sleep", "run"), t0());

    assert!(task.observe(TaskStatus::running(Some(10))));
    assert!(task.duration().is_none());
    assert!(task.observe(
        TaskStatus::success(json!(1)).with_times(Some(t0() + secs(1)), Some(t0() + secs(11)))
    ));
    assert!(!task.observe(TaskStatus::running(Some(50))));
    assert_eq!(task.status.state, TaskState::Success);
    assert_eq!(task.duration(), Some(Duration::from_secs(10)));
}

#[test]
fn test_resource_snapshot_available_never_negative() {
    let snapshot = ResourceSnapshot::default()
        .with(ResourceKind::Cpu, 2.0, 8.0)
        .with(ResourceKind::Memory, 40.0, 32.0);
    assert_eq!(snapshot.available(ResourceKind::Cpu), 6.0);
    assert_eq!(snapshot.available(ResourceKind::Memory), 0.0);
    assert_eq!(snapshot.available(ResourceKind::Gpu), 0.0);
}

#[test]
fn test_predicates() {
    assert!(Predicate::Exists.matches(Some(&json!("x"))));
    assert!(!Predicate::Exists.matches(Some(&json!(null))));
    assert!(Predicate::Equals(json!("high")).matches(Some(&json!("high"))));
    assert!(Predicate::NotEquals(json!("high")).matches(None));
    assert!(Predicate::GreaterThan(5.0).matches(Some(&json!(7))));
    assert!(!Predicate::LessThan(5.0).matches(Some(&json!("3"))));
    assert!(Predicate::OneOf(vec![json!("cfd"), json!("fea")]).matches(Some(&json!("fea"))));
}

#[test]
fn test_workflow_graph_from_json() {
    let graph: WorkflowGraph = serde_json::from_value(json!({
        "name": "study",
        "start": "mesh",
        "max_retries": 2,
        "steps": [
            {
                "name": "mesh",
                "task": {"tool": "container", "script": "gmsh", "params": {"image": "gmsh"}},
                "edges": {
                    "on_success": {"strategy": "parallel", "branches": ["a", "b"], "join": "report", "mode": "any"},
                    "fallbacks": ["report"]
                }
            },
            {"name": "a", "task": {"tool": "sleep", "script": "a"}},
            {"name": "b", "task": {"tool": "sleep", "script": "b"}, "edges": {"retry": false}, "timeout_secs": 30},
            {
                "name": "report",
                "task": {"tool": "echo", "script": "report"},
                "edges": {"on_success": {"strategy": "next", "target": "complete"}}
            }
        ]
    }))
    .unwrap();

    assert_eq!(graph.max_retries, Some(2));
    let mesh = graph.find_step("mesh").unwrap();
    assert!(matches!(mesh.edges.on_success, SuccessRoute::Parallel { .. }));
    assert_eq!(mesh.edges.targets(), vec!["a", "b", "report", "report"]);
    assert!(mesh.edges.retry);

    let b = graph.find_step("b").unwrap();
    assert!(!b.edges.retry);
    assert_eq!(b.timeout(), Some(Duration::from_secs(30)));
    assert!(matches!(
        &graph.find_step("report").unwrap().edges.on_success,
        SuccessRoute::Next { target: Target::Complete }
    ));
    assert!(matches!(
        graph.find_step("a").unwrap().edges.on_success,
        SuccessRoute::Next { target: Target::Complete }
    ));
}

#[tokio::test]
async fn test_manual_clock_sleep_advances_time() {
    let clock = ManualClock::new(t0());
    clock.sleep(Duration::from_secs(90)).await;
    assert_eq!(clock.now(), t0() + secs(90));
    clock.advance(Duration::from_secs(10));
    assert_eq!(clock.now(), t0() + secs(100));
}

#[tokio::test]
async fn test_event_bus_delivers_to_subscribers() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    bus.emit(ExecutionEvent::TaskFinished {
        task_id: TaskId::new("task-9"),
        state: TaskState::Success,
        timestamp: t0(),
    });

    match rx.recv().await.unwrap() {
        ExecutionEvent::TaskFinished { task_id, state, .. } => {
            assert_eq!(task_id.as_str(), "task-9");
            assert_eq!(state, TaskState::Success);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
