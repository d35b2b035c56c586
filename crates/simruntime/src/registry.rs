use async_trait::async_trait;
use simcore::{Params, TaskId, ToolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::history::JobResourceUsage;

/// Something a local worker can execute: a simulation binary, a container,
/// a shell script.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used at submission (e.g. "container", "shell")
    fn name(&self) -> &str;

    /// Run one task
    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError>;

    /// Optional: reject bad parameters at submission time
    fn validate_params(&self, _script: &str, _params: &Params) -> Result<(), ToolError> {
        Ok(())
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::default()
    }
}

/// Execution context handed to a tool by the worker pool.
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub script: String,
    pub params: Params,
    pub progress: ProgressHandle,
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(task_id: TaskId, script: impl Into<String>, params: Params) -> Self {
        Self {
            task_id,
            script: script.into(),
            params,
            progress: ProgressHandle::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn require_param(&self, name: &str) -> Result<&serde_json::Value, ToolError> {
        self.params
            .get(name)
            .ok_or_else(|| ToolError::MissingParam(name.to_string()))
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(|v| v.as_f64())
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.params.get(name).and_then(|v| v.as_bool())
    }
}

/// Shared progress percentage a running tool can update.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle(Arc<AtomicU8>);

impl ProgressHandle {
    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: serde_json::Value,
}

impl ToolOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self { result }
    }

    /// Attach resource accounting; it ends up in the job history record.
    pub fn with_resource_usage(mut self, usage: JobResourceUsage) -> Self {
        let usage = serde_json::to_value(usage).unwrap_or_default();
        match &mut self.result {
            serde_json::Value::Object(map) => {
                map.insert("resource_usage".to_string(), usage);
            }
            other => {
                let value = other.take();
                *other = serde_json::json!({ "value": value, "resource_usage": usage });
            }
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub description: String,
    pub category: String,
    pub params: Vec<ParamDefinition>,
}

impl Default for ToolMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ParamDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }
}

/// Registry of tools available to the local worker pool
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!("Registering tool: {}", name);
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_metadata(&self, name: &str) -> Option<ToolMetadata> {
        self.tools.get(name).map(|t| t.metadata())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
