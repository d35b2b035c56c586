//! Job history: one JSON line per terminal task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simcore::{HistoryError, Params, Task, TaskState};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResourceUsage {
    #[serde(default)]
    pub cpu_user_seconds: f64,
    #[serde(default)]
    pub cpu_system_seconds: f64,
    #[serde(default)]
    pub memory_peak_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: String,
    pub tool: String,
    pub script: String,
    pub params: Params,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: TaskState,
    #[serde(default)]
    pub resource_usage: JobResourceUsage,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobRecord {
    /// Build a record for a terminal task; `None` while it is still active.
    pub fn from_task(task: &Task) -> Option<Self> {
        if !task.status.is_terminal() {
            return None;
        }
        let start_time = task.started_at();
        let end_time = task.status.finished_at.unwrap_or(start_time);
        let duration_seconds = task.duration().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let resource_usage = task
            .status
            .result
            .as_ref()
            .and_then(|r| r.get("resource_usage"))
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default();

        Some(Self {
            task_id: task.id.to_string(),
            tool: task.tool.clone(),
            script: task.script.clone(),
            params: task.params.clone(),
            start_time,
            end_time,
            duration_seconds,
            status: task.status.state,
            resource_usage,
            error: task.status.error.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub count: usize,
    pub failures: usize,
    pub avg_duration_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_tool: BTreeMap<String, ToolStats>,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub total_cpu_seconds: f64,
    pub peak_memory_mb: f64,
}

impl JobStats {
    pub fn from_records(records: &[JobRecord]) -> Self {
        let mut stats = JobStats {
            total: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return stats;
        }

        let mut durations: BTreeMap<String, f64> = BTreeMap::new();
        let mut successes = 0usize;
        let mut total_duration = 0.0;

        for record in records {
            *stats.by_status.entry(record.status.to_string()).or_default() += 1;
            let tool = stats.by_tool.entry(record.tool.clone()).or_default();
            tool.count += 1;
            if record.status.is_success() {
                successes += 1;
            } else {
                tool.failures += 1;
            }
            *durations.entry(record.tool.clone()).or_default() += record.duration_seconds;
            total_duration += record.duration_seconds;
            stats.total_cpu_seconds +=
                record.resource_usage.cpu_user_seconds + record.resource_usage.cpu_system_seconds;
            stats.peak_memory_mb = stats.peak_memory_mb.max(record.resource_usage.memory_peak_mb);
        }

        for (tool, total) in durations {
            if let Some(entry) = stats.by_tool.get_mut(&tool) {
                entry.avg_duration_seconds = total / entry.count as f64;
            }
        }
        stats.success_rate = successes as f64 / records.len() as f64;
        stats.avg_duration_seconds = total_duration / records.len() as f64;
        stats
    }
}

/// Appends job records to a JSON-lines file and answers queries over it.
pub struct JobMonitor {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JobMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a terminal task. Active tasks are ignored.
    pub async fn record(&self, task: &Task) -> Result<(), HistoryError> {
        let Some(record) = JobRecord::from_task(task) else {
            return Ok(());
        };
        self.append(&record).await
    }

    pub async fn append(&self, record: &JobRecord) -> Result<(), HistoryError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        tracing::debug!(task_id = %record.task_id, "Recorded job history");
        Ok(())
    }

    /// All records in file order. A missing file is an empty history.
    pub async fn load(&self) -> Result<Vec<JobRecord>, HistoryError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| HistoryError::Malformed {
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    /// Most recent `limit` records, newest last.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, HistoryError> {
        let mut records = self.load().await?;
        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        Ok(records)
    }

    /// Latest record for a task.
    pub async fn details(&self, task_id: &str) -> Result<JobRecord, HistoryError> {
        self.load()
            .await?
            .into_iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .ok_or_else(|| HistoryError::NotFound(task_id.to_string()))
    }

    pub async fn stats(&self) -> Result<JobStats, HistoryError> {
        Ok(JobStats::from_records(&self.load().await?))
    }
}
