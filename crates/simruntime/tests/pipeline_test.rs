mod common;

use common::{init_tracing, manual_clock, pipeline, ScriptedQueue};
use serde_json::json;
use simcore::{Clock, PipelineError, TaskSpec, TaskState};
use simruntime::ParamGrid;
use std::sync::Arc;
use std::time::Duration;

fn sleep_task(script: &str, duration: f64) -> TaskSpec {
    TaskSpec::new("sim", script).with_param("duration", duration)
}

#[tokio::test]
async fn test_parameter_sweep_submits_cartesian_product() {
    init_tracing();
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let grid = ParamGrid::new()
        .axis("mesh", ["coarse", "fine"])
        .axis("re", [100, 200, 400]);
    assert_eq!(grid.len(), 6);

    let ids = pipeline.parameter_sweep("sim", "solve", &grid).await.unwrap();
    assert_eq!(ids.len(), 6);

    let params: Vec<_> = queue
        .submitted()
        .into_iter()
        .map(|s| (s.params["mesh"].clone(), s.params["re"].clone()))
        .collect();
    assert_eq!(
        params,
        vec![
            (json!("coarse"), json!(100)),
            (json!("coarse"), json!(200)),
            (json!("coarse"), json!(400)),
            (json!("fine"), json!(100)),
            (json!("fine"), json!(200)),
            (json!("fine"), json!(400)),
        ]
    );
}

#[tokio::test]
async fn test_empty_grid_submits_nothing() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let grid = ParamGrid::new().axis("re", Vec::<i64>::new());
    let ids = pipeline.parameter_sweep("sim", "solve", &grid).await.unwrap();
    assert!(ids.is_empty());
    assert!(queue.submitted().is_empty());
}

#[tokio::test]
async fn test_wait_for_any_returns_first_finisher_and_leaves_others() {
    init_tracing();
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let tasks = [
        sleep_task("slow", 30.0),
        sleep_task("fast", 5.0),
        sleep_task("medium", 10.0),
    ];
    let ids = pipeline.submit_workflow(&tasks, false).await.unwrap();

    let (winner, status) = pipeline
        .wait_for_any(&ids, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(winner, ids[1]);
    assert_eq!(status.state, TaskState::Success);
    assert!(queue.cancelled().is_empty());

    let slow = pipeline.get_status(&ids[0]).await.unwrap();
    assert_eq!(slow.state, TaskState::Running);
}

#[tokio::test]
async fn test_wait_for_any_rejects_empty_set() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue, clock);

    let err = pipeline
        .wait_for_any(&[], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyTaskSet));
}

#[tokio::test]
async fn test_sequential_workflow_stops_at_first_failure() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let tasks = [
        sleep_task("mesh", 2.0)
            .with_param("outcome", "failure")
            .with_param("error", "mesh generation crashed"),
        sleep_task("solve", 2.0),
    ];
    let err = pipeline.submit_workflow(&tasks, true).await.unwrap_err();

    match err {
        PipelineError::StepFailed {
            index,
            state,
            error,
            submitted,
            ..
        } => {
            assert_eq!(index, 0);
            assert_eq!(state, TaskState::Failure);
            assert_eq!(error.as_deref(), Some("mesh generation crashed"));
            assert_eq!(submitted.len(), 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(queue.scripts(), vec!["mesh"]);
}

#[tokio::test]
async fn test_sequential_workflow_waits_between_tasks() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let tasks = [sleep_task("mesh", 5.0), sleep_task("solve", 5.0)];
    let ids = pipeline.submit_workflow(&tasks, true).await.unwrap();
    assert_eq!(ids.len(), 2);

    let times = queue.submit_times();
    assert!(times[1] - times[0] >= chrono::Duration::seconds(5));
}

#[tokio::test]
async fn test_parallel_workflow_submits_everything_up_front() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let tasks = [
        sleep_task("a", 5.0).with_param("outcome", "failure"),
        sleep_task("b", 5.0),
        sleep_task("c", 5.0),
    ];
    let ids = pipeline.submit_workflow(&tasks, false).await.unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(queue.scripts(), vec!["a", "b", "c"]);
    assert!(queue.submit_times().iter().all(|t| *t == common::t0()));
}

#[tokio::test]
async fn test_parallel_stats_report_speedup() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let tasks: Vec<TaskSpec> = [0.0, 0.0, 2.0, 2.0]
        .iter()
        .enumerate()
        .map(|(i, delay)| sleep_task(&format!("case-{}", i), 10.0).with_param("delay", *delay))
        .collect();
    let ids = pipeline.submit_workflow(&tasks, false).await.unwrap();
    pipeline
        .wait_for_all(&ids, Duration::from_secs(60))
        .await
        .unwrap();

    let stats = pipeline.get_parallel_execution_stats(&ids).await.unwrap();
    assert_eq!(stats.task_count, 4);
    assert_eq!(stats.completed, 4);
    assert!((stats.total_duration_secs - 40.0).abs() < 1e-6);
    assert!((stats.avg_duration_secs - 10.0).abs() < 1e-6);
    assert!((stats.max_duration_secs - 10.0).abs() < 1e-6);
    assert!((stats.wall_clock_secs - 12.0).abs() < 1e-6);
    assert!((stats.speedup - 40.0 / 12.0).abs() < 1e-6);
    assert!((stats.efficiency - 40.0 / 48.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_parallel_stats_empty_when_nothing_finished() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let ids = pipeline
        .submit_workflow(&[sleep_task("a", 10.0), sleep_task("b", 10.0)], false)
        .await
        .unwrap();
    let stats = pipeline.get_parallel_execution_stats(&ids).await.unwrap();
    assert_eq!(stats.task_count, 2);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.speedup, 0.0);
    assert_eq!(stats.wall_clock_secs, 0.0);
}

#[tokio::test]
async fn test_terminal_status_is_cached() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock.clone());

    let id = pipeline
        .submit(&sleep_task("solve", 1.0).with_param("result", json!({"residual": 1e-6})))
        .await
        .unwrap();
    let status = pipeline
        .wait_for_task(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status.state, TaskState::Success);

    let polls = queue.polls(&id);
    clock.advance(Duration::from_secs(100));
    let again = pipeline.get_status(&id).await.unwrap();
    assert_eq!(again, status);
    assert_eq!(queue.polls(&id), polls);
    assert_eq!(again.result, Some(json!({"residual": 1e-6})));
}

#[tokio::test]
async fn test_wait_timeout_leaves_task_running() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock.clone());

    let id = pipeline.submit(&sleep_task("long", 100.0)).await.unwrap();
    let err = pipeline
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        PipelineError::Timeout { task_ids, waited } => {
            assert_eq!(task_ids, vec![id.clone()]);
            assert!(waited >= Duration::from_secs(5));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(queue.cancelled().is_empty());
    assert_eq!(pipeline.get_status(&id).await.unwrap().state, TaskState::Running);
}

#[tokio::test]
async fn test_batch_workflow_waits_for_each_group() {
    init_tracing();
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock);

    let tasks: Vec<TaskSpec> = (0..5).map(|i| sleep_task(&format!("case-{}", i), 4.0)).collect();
    let mut progress = Vec::new();
    let ids = pipeline
        .submit_batch_workflow(&tasks, Some(2), |p| progress.push(p.clone()))
        .await
        .unwrap();

    assert_eq!(ids.len(), 5);
    assert_eq!(progress.len(), 3);
    assert_eq!(
        progress.iter().map(|p| p.submitted).collect::<Vec<_>>(),
        vec![2, 4, 5]
    );
    assert!(progress.iter().all(|p| p.batch_count == 3 && p.total == 5));
    assert_eq!(progress[2].task_ids, vec![ids[4].clone()]);

    let times = queue.submit_times();
    assert_eq!(times[0], times[1]);
    assert!(times[2] - times[1] >= chrono::Duration::seconds(4));
    assert!(times[4] - times[3] >= chrono::Duration::seconds(4));
}

#[tokio::test]
async fn test_cancel_finished_task_returns_false() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = pipeline(queue.clone(), clock.clone());

    let done = pipeline.submit(&sleep_task("done", 1.0)).await.unwrap();
    let running = pipeline.submit(&sleep_task("running", 50.0)).await.unwrap();
    clock.advance(Duration::from_secs(2));

    assert!(!pipeline.cancel_task(&done).await.unwrap());
    assert!(pipeline.cancel_task(&running).await.unwrap());
    assert_eq!(queue.cancelled(), vec![running.clone()]);
    assert_eq!(
        pipeline.get_status(&running).await.unwrap().state,
        TaskState::Cancelled
    );
}

#[tokio::test]
async fn test_submission_failure_surfaces_queue_unavailable() {
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    queue.set_available(false);
    let pipeline = pipeline(queue, clock.clone());

    let err = pipeline.submit(&sleep_task("solve", 1.0)).await.unwrap_err();
    assert!(matches!(err, PipelineError::QueueUnavailable(_)));
    assert_eq!(clock.now(), common::t0());
}

#[test]
fn test_param_grid_from_json() {
    let grid = ParamGrid::from_json(&json!({"re": [100, 200], "mesh": "fine"})).unwrap();
    assert_eq!(grid.len(), 2);
    assert!(grid
        .combinations()
        .iter()
        .all(|c| c["mesh"] == json!("fine")));
    assert!(ParamGrid::from_json(&json!([1, 2])).is_none());
}
