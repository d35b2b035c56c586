//! Reading workflow definitions from disk.

use crate::pipeline::ParamGrid;
use simcore::{SimError, TaskSpec, WorkflowError, WorkflowGraph};
use std::path::Path;

/// Load a workflow graph from a JSON file.
pub fn load_workflow_graph(path: impl AsRef<Path>) -> Result<WorkflowGraph, SimError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let graph: WorkflowGraph = serde_json::from_str(&contents)?;
    crate::executor::validate_graph(&graph)?;
    Ok(graph)
}

/// Load a `[{tool, script, params}]` task list.
pub fn load_task_list(path: impl AsRef<Path>) -> Result<Vec<TaskSpec>, SimError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&contents)?)
}

/// Parse a parameter grid from inline JSON (`{"a": [1, 2], "b": [10]}`) or,
/// when `source` names an existing file, from that file.
pub fn load_param_grid(source: &str) -> Result<ParamGrid, SimError> {
    let raw = if Path::new(source).is_file() {
        std::fs::read_to_string(source)?
    } else {
        source.to_string()
    };
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    ParamGrid::from_json(&value).ok_or_else(|| {
        WorkflowError::Invalid("parameter grid must be a JSON object of name -> [values]".to_string())
            .into()
    })
}
