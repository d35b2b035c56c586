use crate::process::run_process;
use async_trait::async_trait;
use serde_json::Value;
use simcore::{Params, ToolError};
use simruntime::{ParamDefinition, Tool, ToolContext, ToolMetadata, ToolOutput};
use std::time::Duration;
use tokio::process::Command;

/// Runs the task's script with `sh -c` on the worker host.
///
/// Scalar parameters are exported as `SIMFLOW_PARAM_<NAME>`; the whole
/// parameter map is also written to stdin as JSON.
pub struct ShellTool {
    shell: String,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

fn env_name(param: &str) -> String {
    let cleaned: String = param
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("SIMFLOW_PARAM_{}", cleaned)
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn validate_params(&self, script: &str, _params: &Params) -> Result<(), ToolError> {
        if script.trim().is_empty() {
            return Err(ToolError::Configuration("shell script is empty".to_string()));
        }
        Ok(())
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&ctx.script);
        for (key, value) in &ctx.params {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            cmd.env(env_name(key), value);
        }
        if let Some(dir) = ctx.param_str("workdir") {
            cmd.current_dir(dir);
        }

        let timeout = ctx
            .param_f64("timeout")
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64);
        let stdin = serde_json::to_vec(&ctx.params)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to serialize params: {}", e)))?;

        tracing::debug!(task_id = %ctx.task_id, script = %ctx.script, "Running shell script");
        let output = run_process(cmd, stdin, timeout, &ctx.cancellation).await?;
        output.check("shell script")?;
        Ok(output.into_tool_output())
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            description: "Run the script with sh -c on the worker".to_string(),
            category: "process".to_string(),
            params: vec![
                ParamDefinition::new("workdir", "Working directory", false),
                ParamDefinition::new("timeout", "Kill the process after this many seconds", false),
            ],
        }
    }
}
