use async_trait::async_trait;
use serde_json::json;
use simcore::ToolError;
use simruntime::{Tool, ToolContext, ToolMetadata, ToolOutput};

/// Logs its script and parameters and returns them as the result
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        tracing::info!(task_id = %ctx.task_id, script = %ctx.script, "echo");
        for (key, value) in &ctx.params {
            tracing::debug!("  {}: {}", key, value);
        }
        ctx.progress.set(100);

        Ok(ToolOutput::new(json!({
            "script": ctx.script,
            "params": ctx.params,
        })))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            description: "Return the script and parameters unchanged".to_string(),
            category: "debug".to_string(),
            params: vec![],
        }
    }
}
