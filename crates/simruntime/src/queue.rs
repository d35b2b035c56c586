use async_trait::async_trait;
use simcore::{QueueError, TaskId, TaskSpec, TaskStatus};

/// Contract of the external task queue: fire-and-forget submission,
/// non-blocking polling and advisory cancellation.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task and return its id. Never waits for execution.
    async fn submit(&self, spec: &TaskSpec) -> Result<TaskId, QueueError>;

    /// Current status of a task. `UnknownTask` if it was never issued or has
    /// been purged.
    async fn poll(&self, task_id: &TaskId) -> Result<TaskStatus, QueueError>;

    /// Request cancellation. Returns false if the task was already terminal.
    /// A cancelled task may still finish successfully.
    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// Drop terminal tasks from the queue's bookkeeping, returning how many
    /// were removed. Backends that expire results on their own keep the
    /// default.
    async fn purge_finished(&self) -> usize {
        0
    }
}
