use crate::process::{run_process, split_command};
use async_trait::async_trait;
use serde_json::Value;
use simcore::{Params, ToolError};
use simruntime::{ParamDefinition, Tool, ToolContext, ToolMetadata, ToolOutput};
use std::time::Duration;
use tokio::process::Command;

/// Runs a simulation inside a Docker container.
///
/// The task's `script` is the command executed in the container; the task
/// parameters are written to the container's stdin as one JSON object.
/// Recognised parameters: `image` (required), `env`, `volumes`, `workdir`,
/// `user`, `network`, `cpu_limit`, `memory_limit`, `gpus`, `timeout`
/// (seconds), `auto_pull`.
pub struct ContainerTool {
    docker: String,
}

impl ContainerTool {
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }

    /// Use a different docker-compatible binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            docker: binary.into(),
        }
    }
}

impl Default for ContainerTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct VolumeMount {
    host_path: String,
    container_path: String,
    read_only: bool,
}

impl VolumeMount {
    fn parse(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [host, container] => Some(Self {
                host_path: host.to_string(),
                container_path: container.to_string(),
                read_only: false,
            }),
            [host, container, mode] => Some(Self {
                host_path: host.to_string(),
                container_path: container.to_string(),
                read_only: *mode == "ro",
            }),
            _ => None,
        }
    }

    fn arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

#[derive(Debug, Clone)]
struct ContainerConfig {
    image: String,
    command: Vec<String>,
    env: Vec<(String, String)>,
    volumes: Vec<VolumeMount>,
    working_dir: Option<String>,
    user: Option<String>,
    network: Option<String>,
    cpu_limit: Option<String>,
    memory_limit: Option<String>,
    gpus: Option<String>,
    timeout: Option<Duration>,
    auto_pull: bool,
}

fn string_param(params: &Params, name: &str) -> Option<String> {
    params.get(name).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

impl ContainerConfig {
    fn parse(script: &str, params: &Params) -> Result<Self, ToolError> {
        let image = match params.get("image") {
            Some(Value::String(image)) if !image.trim().is_empty() => image.clone(),
            Some(other) => {
                return Err(ToolError::InvalidParam {
                    field: "image".to_string(),
                    expected: "non-empty string".to_string(),
                    actual: other.to_string(),
                })
            }
            None => return Err(ToolError::MissingParam("image".to_string())),
        };

        let env = match params.get("env") {
            Some(Value::Object(vars)) => vars
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect(),
            Some(other) => {
                return Err(ToolError::InvalidParam {
                    field: "env".to_string(),
                    expected: "object".to_string(),
                    actual: other.to_string(),
                })
            }
            None => Vec::new(),
        };

        let mut volumes = Vec::new();
        if let Some(Value::Array(specs)) = params.get("volumes") {
            for spec in specs {
                let mount = spec.as_str().and_then(VolumeMount::parse).ok_or_else(|| {
                    ToolError::InvalidParam {
                        field: "volumes".to_string(),
                        expected: "host:container[:ro]".to_string(),
                        actual: spec.to_string(),
                    }
                })?;
                volumes.push(mount);
            }
        }

        let timeout = params
            .get("timeout")
            .and_then(Value::as_f64)
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64);

        Ok(Self {
            image,
            command: split_command(script),
            env,
            volumes,
            working_dir: string_param(params, "workdir"),
            user: string_param(params, "user"),
            network: string_param(params, "network"),
            cpu_limit: string_param(params, "cpu_limit"),
            memory_limit: string_param(params, "memory_limit"),
            gpus: string_param(params, "gpus"),
            timeout,
            auto_pull: params.get("auto_pull").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn docker_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(volume.arg());
        }
        let flags = [
            ("-w", &self.working_dir),
            ("-u", &self.user),
            ("--network", &self.network),
            ("--cpus", &self.cpu_limit),
            ("--memory", &self.memory_limit),
            ("--gpus", &self.gpus),
        ];
        for (flag, value) in flags {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

impl ContainerTool {
    async fn pull_if_missing(&self, image: &str) -> Result<(), ToolError> {
        let present = Command::new(&self.docker)
            .args(["image", "inspect", image])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| ToolError::Configuration(format!("Failed to run {}: {}", self.docker, e)))?;
        if present.success() {
            return Ok(());
        }

        tracing::info!(image, "Pulling image");
        let pulled = Command::new(&self.docker)
            .args(["pull", image])
            .status()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to pull image: {}", e)))?;
        if !pulled.success() {
            return Err(ToolError::Configuration(format!("Failed to pull image: {}", image)));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ContainerTool {
    fn name(&self) -> &str {
        "container"
    }

    fn validate_params(&self, script: &str, params: &Params) -> Result<(), ToolError> {
        ContainerConfig::parse(script, params).map(|_| ())
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let config = ContainerConfig::parse(&ctx.script, &ctx.params)?;
        tracing::info!(task_id = %ctx.task_id, image = %config.image, "Running container");

        if config.auto_pull {
            self.pull_if_missing(&config.image).await?;
        }

        let mut cmd = Command::new(&self.docker);
        cmd.args(config.docker_args());
        let stdin = serde_json::to_vec(&ctx.params)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to serialize params: {}", e)))?;

        ctx.progress.set(1);
        let output = run_process(cmd, stdin, config.timeout, &ctx.cancellation).await?;
        output.check(&format!("container {}", config.image))?;
        ctx.progress.set(100);

        tracing::info!(task_id = %ctx.task_id, elapsed = ?output.elapsed, "Container finished");
        Ok(output.into_tool_output())
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            description: "Run the script as a command inside a Docker container".to_string(),
            category: "container".to_string(),
            params: vec![
                ParamDefinition::new("image", "Container image", true),
                ParamDefinition::new("env", "Environment variables (object)", false),
                ParamDefinition::new("volumes", "host:container[:ro] mounts", false),
                ParamDefinition::new("workdir", "Working directory in the container", false),
                ParamDefinition::new("cpu_limit", "Value for --cpus", false),
                ParamDefinition::new("memory_limit", "Value for --memory", false),
                ParamDefinition::new("gpus", "Value for --gpus", false),
                ParamDefinition::new("timeout", "Kill the container after this many seconds", false),
                ParamDefinition::new("auto_pull", "Pull the image when missing", false),
            ],
        }
    }
}
