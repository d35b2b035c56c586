use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Parameter map handed to a tool: string keys, scalar or nested JSON values.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Opaque task identifier assigned by the queue at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Timeout | TaskState::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Success)
    }

    /// Failure-like terminal states the router may retry.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failure | TaskState::Timeout)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Success => "Success",
            TaskState::Failure => "Failure",
            TaskState::Timeout => "Timeout",
            TaskState::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// One entry of a workflow definition: `{tool, script, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub tool: String,
    pub script: String,
    #[serde(default)]
    pub params: Params,
}

impl TaskSpec {
    pub fn new(tool: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            script: script.into(),
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Status reported by the queue for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            progress: None,
            result: None,
            error: None,
            error_code: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn pending() -> Self {
        Self::new(TaskState::Pending)
    }

    pub fn running(progress: Option<u8>) -> Self {
        Self {
            progress: progress.map(|p| p.min(100)),
            ..Self::new(TaskState::Running)
        }
    }

    pub fn success(result: serde_json::Value) -> Self {
        Self {
            progress: Some(100),
            result: Some(result),
            ..Self::new(TaskState::Success)
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(TaskState::Failure)
        }
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(TaskState::Timeout)
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TaskState::Cancelled)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_times(
        mut self,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Run time as reported by the queue, when both ends are known.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// A submitted task as tracked by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tool: String,
    pub script: String,
    pub params: Params,
    pub submitted_at: DateTime<Utc>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tool: spec.tool,
            script: spec.script,
            params: spec.params,
            submitted_at,
            status: TaskStatus::pending(),
        }
    }

    /// Apply a freshly polled status. Terminal statuses are sticky: once the
    /// task has been seen terminal, later polls are ignored. Returns whether
    /// the stored status changed.
    pub fn observe(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    /// Start of execution, falling back to submission time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.status.started_at.unwrap_or(self.submitted_at)
    }

    /// Duration of a terminal task. `None` while the task is still active.
    pub fn duration(&self) -> Option<Duration> {
        if !self.status.is_terminal() {
            return None;
        }
        let end = self.status.finished_at?;
        (end - self.started_at()).to_std().ok()
    }

    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            tool: self.tool.clone(),
            script: self.script.clone(),
            params: self.params.clone(),
        }
    }
}
