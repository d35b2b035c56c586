//! Orchestration runtime
//!
//! This crate provides the task pipeline over a queue backend, the routing
//! engine that picks the next step, the executor that drives workflow
//! graphs, an in-process worker pool and job history.

mod executor;
mod history;
mod loader;
mod local;
mod pipeline;
mod queue;
mod registry;
mod router;
mod runtime;

pub use executor::{
    validate_graph, ExecutorConfig, RouteRecord, WorkflowExecutor, WorkflowOutcome, WorkflowReport,
};
pub use history::{JobMonitor, JobRecord, JobResourceUsage, JobStats, ToolStats};
pub use loader::{load_param_grid, load_task_list, load_workflow_graph};
pub use local::LocalQueue;
pub use pipeline::{
    default_batch_size, BatchProgress, ParallelStats, ParamGrid, PipelineConfig, TaskPipeline,
};
pub use queue::TaskQueue;
pub use registry::{
    ParamDefinition, ProgressHandle, Tool, ToolContext, ToolMetadata, ToolOutput, ToolRegistry,
};
pub use router::{backoff_seconds, RouterConfig, WorkflowRouter};
pub use runtime::{RuntimeConfig, SimRuntime};
