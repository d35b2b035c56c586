mod common;

use chrono::Duration as ChronoDuration;
use common::{manual_clock, t0, ScriptedQueue};
use serde_json::json;
use simcore::{HistoryError, Task, TaskId, TaskSpec, TaskState, TaskStatus};
use simruntime::{JobMonitor, JobRecord, JobResourceUsage, TaskPipeline};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn finished_task(id: &str, tool: &str, state: TaskState, secs: i64, usage: Option<JobResourceUsage>) -> Task {
    let mut task = Task::new(TaskId::new(id), TaskSpec::new(tool, "run").with_param("re", 100), t0());
    let mut result = json!({"ok": true});
    if let Some(usage) = usage {
        result["resource_usage"] = serde_json::to_value(usage).unwrap();
    }
    let status = match state {
        TaskState::Success => TaskStatus::success(result),
        TaskState::Timeout => TaskStatus::timeout("took too long"),
        _ => TaskStatus::failure("solver diverged"),
    };
    task.observe(status.with_times(Some(t0()), Some(t0() + ChronoDuration::seconds(secs))));
    task
}

fn monitor(dir: &TempDir) -> JobMonitor {
    JobMonitor::new(dir.path().join("history").join("jobs.jsonl"))
}

#[tokio::test]
async fn test_records_terminal_tasks_only() {
    let dir = TempDir::new().unwrap();
    let monitor = monitor(&dir);

    let active = Task::new(TaskId::new("active"), TaskSpec::new("shell", "run"), t0());
    monitor.record(&active).await.unwrap();
    assert!(monitor.load().await.unwrap().is_empty());

    monitor
        .record(&finished_task("t1", "shell", TaskState::Success, 12, None))
        .await
        .unwrap();
    let records = monitor.load().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task_id, "t1");
    assert_eq!(records[0].duration_seconds, 12.0);
    assert_eq!(records[0].params["re"], json!(100));
    assert_eq!(records[0].status, TaskState::Success);
}

#[tokio::test]
async fn test_history_limit_and_details() {
    let dir = TempDir::new().unwrap();
    let monitor = monitor(&dir);

    for i in 0..5 {
        monitor
            .record(&finished_task(&format!("t{}", i), "shell", TaskState::Success, i, None))
            .await
            .unwrap();
    }

    let recent = monitor.history(Some(2)).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["t3", "t4"]);
    assert_eq!(monitor.history(None).await.unwrap().len(), 5);

    let detail = monitor.details("t2").await.unwrap();
    assert_eq!(detail.duration_seconds, 2.0);
    assert!(matches!(
        monitor.details("nope").await,
        Err(HistoryError::NotFound(id)) if id == "nope"
    ));
}

#[tokio::test]
async fn test_stats_aggregate_by_tool_and_status() {
    let dir = TempDir::new().unwrap();
    let monitor = monitor(&dir);
    let usage = JobResourceUsage {
        cpu_user_seconds: 30.0,
        cpu_system_seconds: 5.0,
        memory_peak_mb: 2048.0,
    };

    monitor
        .record(&finished_task("a", "container", TaskState::Success, 10, Some(usage)))
        .await
        .unwrap();
    monitor
        .record(&finished_task("b", "container", TaskState::Failure, 30, None))
        .await
        .unwrap();
    monitor
        .record(&finished_task("c", "shell", TaskState::Timeout, 20, None))
        .await
        .unwrap();

    let stats = monitor.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert!((stats.success_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.avg_duration_seconds, 20.0);
    assert_eq!(stats.by_status["Success"], 1);
    assert_eq!(stats.by_status["Timeout"], 1);
    assert_eq!(stats.by_tool["container"].count, 2);
    assert_eq!(stats.by_tool["container"].failures, 1);
    assert_eq!(stats.by_tool["container"].avg_duration_seconds, 20.0);
    assert_eq!(stats.total_cpu_seconds, 35.0);
    assert_eq!(stats.peak_memory_mb, 2048.0);
}

#[tokio::test]
async fn test_missing_file_is_empty_history() {
    let dir = TempDir::new().unwrap();
    let monitor = monitor(&dir);

    assert!(monitor.history(Some(10)).await.unwrap().is_empty());
    let stats = monitor.stats().await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn test_malformed_line_reports_line_number() {
    let dir = TempDir::new().unwrap();
    let monitor = monitor(&dir);
    monitor
        .record(&finished_task("ok", "shell", TaskState::Success, 1, None))
        .await
        .unwrap();

    let mut contents = std::fs::read_to_string(monitor.path()).unwrap();
    contents.push_str("{not json\n");
    std::fs::write(monitor.path(), contents).unwrap();

    match monitor.load().await {
        Err(HistoryError::Malformed { line, .. }) => assert_eq!(line, 2),
        other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
    }
}

#[tokio::test]
async fn test_pipeline_writes_history_once_per_task() {
    let dir = TempDir::new().unwrap();
    let monitor = Arc::new(monitor(&dir));
    let clock = manual_clock();
    let queue = Arc::new(ScriptedQueue::new(clock.clone()));
    let pipeline = TaskPipeline::new(queue, clock, common::pipeline_config()).with_monitor(monitor.clone());

    let ok = pipeline
        .submit(&TaskSpec::new("sim", "solve").with_param("duration", 3))
        .await
        .unwrap();
    let bad = pipeline
        .submit(
            &TaskSpec::new("sim", "mesh")
                .with_param("duration", 1)
                .with_param("outcome", "failure"),
        )
        .await
        .unwrap();
    pipeline
        .wait_for_all(&[ok.clone(), bad.clone()], Duration::from_secs(30))
        .await
        .unwrap();
    pipeline.get_status(&ok).await.unwrap();
    pipeline.get_status(&bad).await.unwrap();

    let records: Vec<JobRecord> = monitor.load().await.unwrap();
    assert_eq!(records.len(), 2);
    let ok_record = records.iter().find(|r| r.task_id == ok.as_str()).unwrap();
    assert_eq!(ok_record.duration_seconds, 3.0);
    assert_eq!(ok_record.tool, "sim");
    let bad_record = records.iter().find(|r| r.task_id == bad.as_str()).unwrap();
    assert_eq!(bad_record.status, TaskState::Failure);
    assert!(bad_record.error.is_some());
}
