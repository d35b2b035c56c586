//! Child-process plumbing shared by the container and shell tools.

use simcore::ToolError;
use simruntime::{JobResourceUsage, ToolOutput};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Exit status the kernel OOM killer leaves behind (128 + SIGKILL).
pub const OOM_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout parsed as JSON, else the raw text.
    pub fn parsed_stdout(&self) -> serde_json::Value {
        serde_json::from_str(self.stdout.trim())
            .unwrap_or_else(|_| serde_json::Value::String(self.stdout.clone()))
    }

    /// Map a non-zero exit to the matching tool error.
    pub fn check(&self, what: &str) -> Result<(), ToolError> {
        if self.success() {
            return Ok(());
        }
        let tail: Vec<&str> = self.stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        let detail = tail.join("\n");
        if self.exit_code == OOM_EXIT_CODE {
            return Err(ToolError::ResourceExhausted(format!(
                "{} was killed (exit code {}), out of memory: {}",
                what, self.exit_code, detail
            )));
        }
        Err(ToolError::ExecutionFailed(format!(
            "{} exited with code {}: {}",
            what, self.exit_code, detail
        )))
    }

    /// Result payload handed back to the queue. A `resource_usage` object in
    /// JSON output is lifted into the job's resource accounting.
    pub fn into_tool_output(self) -> ToolOutput {
        let output = self.parsed_stdout();
        let usage: Option<JobResourceUsage> = output
            .get("resource_usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok());

        let result = serde_json::json!({
            "output": output,
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
            "elapsed_seconds": self.elapsed.as_secs_f64(),
        });
        match usage {
            Some(usage) => ToolOutput::new(result).with_resource_usage(usage),
            None => ToolOutput::new(result),
        }
    }
}

/// Spawn `cmd`, feed it `stdin`, and collect its output. The child is killed
/// on timeout or cancellation.
pub async fn run_process(
    mut cmd: Command,
    stdin: Vec<u8>,
    timeout: Option<Duration>,
    cancellation: &CancellationToken,
) -> Result<ProcessOutput, ToolError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn process: {}", e)))?;

    if let Some(mut pipe) = child.stdin.take() {
        if !stdin.is_empty() {
            tracing::debug!(bytes = stdin.len(), "Writing process stdin");
            pipe.write_all(&stdin)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write stdin: {}", e)))?;
        }
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let collect = async {
        let stdout = async {
            let mut data = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut data).await;
            }
            data
        };
        let stderr = async {
            let mut data = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut data).await;
            }
            data
        };
        let (stdout, stderr) = tokio::join!(stdout, stderr);
        let status = child
            .wait()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Process wait failed: {}", e)))?;
        Ok::<_, ToolError>((status, stdout, stderr))
    };

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        result = collect => Some(result?),
        _ = deadline => None,
        _ = cancellation.cancelled() => {
            tracing::info!("Process cancelled, killing it");
            return Err(ToolError::Cancelled);
        }
    };

    let Some((status, stdout, stderr)) = outcome else {
        let seconds = timeout.map(|t| t.as_secs()).unwrap_or_default();
        tracing::warn!(seconds, "Process timed out, killing it");
        return Err(ToolError::Timeout { seconds });
    };

    let stderr = String::from_utf8_lossy(&stderr).to_string();
    for line in stderr.lines().take(10) {
        tracing::debug!("stderr: {}", line);
    }

    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr,
        elapsed: started.elapsed(),
    })
}

/// Split a command line on whitespace, honouring double quotes and
/// backslash escapes.
pub fn split_command(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escape = false;

    for c in s.chars() {
        if escape {
            current.push(c);
            escape = false;
        } else if c == '\\' {
            escape = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if c.is_whitespace() && !in_quotes {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
