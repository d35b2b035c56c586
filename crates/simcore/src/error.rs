use crate::TaskId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported by a task queue backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Task queue unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Submission rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Task queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Timed out after {waited:?} waiting for {} task(s)", .task_ids.len())]
    Timeout {
        task_ids: Vec<TaskId>,
        waited: Duration,
    },

    #[error("Workflow task #{index} ({task_id}) ended in state {state}")]
    StepFailed {
        index: usize,
        task_id: TaskId,
        state: crate::TaskState,
        error: Option<String>,
        submitted: Vec<TaskId>,
    },

    #[error("No task ids given")]
    EmptyTaskSet,
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Unavailable(msg) => PipelineError::QueueUnavailable(msg),
            QueueError::UnknownTask(id) => PipelineError::UnknownTask(id),
            QueueError::Rejected(msg) => PipelineError::Rejected(msg),
        }
    }
}

/// Errors raised by a tool while executing a task on a local worker.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Missing required parameter: {0}")]
    MissingParam(String),

    #[error("Invalid parameter type for '{field}': expected {expected}, got {actual}")]
    InvalidParam {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl ToolError {
    /// Short machine-readable code attached to the failed task's status.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_)
            | ToolError::MissingParam(_)
            | ToolError::InvalidParam { .. }
            | ToolError::Configuration(_) => "configuration",
            ToolError::ResourceExhausted(_) => "resource",
            ToolError::ExecutionFailed(_) => "execution",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step '{step}' routes to unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed history record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No history record for task {0}")]
    NotFound(String),
}
