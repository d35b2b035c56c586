use crate::{RoutingStrategy, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted while tasks and workflows run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    TaskSubmitted {
        task_id: TaskId,
        tool: String,
        script: String,
        timestamp: DateTime<Utc>,
    },
    TaskFinished {
        task_id: TaskId,
        state: TaskState,
        timestamp: DateTime<Utc>,
    },
    WorkflowStarted {
        execution_id: ExecutionId,
        workflow: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: ExecutionId,
        success: bool,
        iterations: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step: String,
        task_id: Option<TaskId>,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step: String,
        state: TaskState,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RouteDecided {
        execution_id: ExecutionId,
        step: String,
        strategy: RoutingStrategy,
        next: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus shared by the pipeline and the executor.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
