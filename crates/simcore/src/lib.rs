//! Core types for the simulation orchestration engine
//!
//! Tasks and their statuses, per-run workflow state, routing decisions,
//! circuit breakers, execution metrics and the workflow graph definition.
//! Nothing in here talks to a queue; the runtime crate does that.

mod circuit;
mod clock;
mod error;
mod events;
mod metrics;
mod resources;
mod routing;
mod state;
mod task;
mod workflow;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{HistoryError, PipelineError, QueueError, SimError, ToolError, WorkflowError};
pub use events::{EventBus, ExecutionEvent, ExecutionId};
pub use metrics::{ExecutionMetrics, ExecutionMetricsStore, MetricKind};
pub use resources::{ResourceKind, ResourceProfiler, ResourceSnapshot, ResourceUsage, StaticProfiler};
pub use routing::{ParallelSplit, RoutingDecision, RoutingStrategy, Target};
pub use state::{ErrorKind, ErrorRecord, Severity, WorkflowState};
pub use task::{Params, Task, TaskId, TaskSpec, TaskState, TaskStatus};
pub use workflow::{ContextRule, JoinMode, Predicate, StepEdges, StepSpec, SuccessRoute, WorkflowGraph};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SimError>;
