use async_trait::async_trait;
use serde_json::json;
use simcore::{Params, ToolError};
use simruntime::{ParamDefinition, Tool, ToolContext, ToolMetadata, ToolOutput};
use tokio::time::{sleep, Duration};

/// Sleeps for `duration_ms`, reporting progress in ten steps.
///
/// With `fail` set, it ends with an error of that kind instead
/// (`execution`, `resource`, `configuration`, `timeout`); the message comes
/// from `error` if given. Handy for rehearsing workflows without a solver.
pub struct SleepTool;

const STEPS: u64 = 10;

fn failure(kind: &str, message: String) -> ToolError {
    match kind {
        "resource" => ToolError::ResourceExhausted(message),
        "configuration" => ToolError::Configuration(message),
        "timeout" => ToolError::Timeout { seconds: 0 },
        _ => ToolError::ExecutionFailed(message),
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn validate_params(&self, _script: &str, params: &Params) -> Result<(), ToolError> {
        match params.get("duration_ms") {
            Some(v) if !v.is_number() => Err(ToolError::InvalidParam {
                field: "duration_ms".to_string(),
                expected: "number".to_string(),
                actual: v.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let duration_ms = ctx.param_f64("duration_ms").unwrap_or(1000.0).max(0.0) as u64;
        let step = Duration::from_millis(duration_ms / STEPS);

        for i in 1..=STEPS {
            tokio::select! {
                _ = sleep(step) => ctx.progress.set((i * 100 / STEPS) as u8),
                _ = ctx.cancellation.cancelled() => return Err(ToolError::Cancelled),
            }
        }

        if let Some(kind) = ctx.param_str("fail") {
            let message = ctx
                .param_str("error")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} failed as requested", ctx.script));
            return Err(failure(kind, message));
        }

        Ok(ToolOutput::new(json!({
            "script": ctx.script,
            "slept_ms": duration_ms,
            "params": ctx.params,
        })))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            description: "Sleep for a while, optionally failing afterwards".to_string(),
            category: "time".to_string(),
            params: vec![
                ParamDefinition::new("duration_ms", "Milliseconds to sleep (default 1000)", false),
                ParamDefinition::new("fail", "Error kind to fail with", false),
                ParamDefinition::new("error", "Error message when failing", false),
            ],
        }
    }
}
