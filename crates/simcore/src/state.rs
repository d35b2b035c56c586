use crate::{ExecutionMetrics, ResourceSnapshot, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

/// Failure taxonomy used to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network or broker hiccup.
    Transient,
    /// Not enough CPU, memory or GPU for the step.
    ResourceExhaustion,
    /// An external validator rejected the result (e.g. no convergence).
    Validation,
    /// Bad parameters or tool configuration.
    Configuration,
    /// Unrecoverable.
    Fatal,
    /// Nothing in the message or code matched.
    Unknown,
}

const CODE_TABLE: &[(&str, ErrorKind)] = &[
    ("transient", ErrorKind::Transient),
    ("timeout", ErrorKind::Transient),
    ("unavailable", ErrorKind::Transient),
    ("resource", ErrorKind::ResourceExhaustion),
    ("oom", ErrorKind::ResourceExhaustion),
    ("137", ErrorKind::ResourceExhaustion),
    ("validation", ErrorKind::Validation),
    ("convergence", ErrorKind::Validation),
    ("configuration", ErrorKind::Configuration),
    ("config", ErrorKind::Configuration),
    ("fatal", ErrorKind::Fatal),
];

// Checked in order; the first kind with a matching fragment wins.
const MESSAGE_TABLE: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Fatal,
        &["fatal", "unrecoverable", "segmentation fault", "corrupt", "panicked"],
    ),
    (
        ErrorKind::Configuration,
        &[
            "configuration",
            "invalid parameter",
            "missing required parameter",
            "invalid parameter type",
            "unknown tool",
            "no such file",
        ],
    ),
    (
        ErrorKind::ResourceExhaustion,
        &[
            "out of memory",
            "oom",
            "resource exhausted",
            "insufficient",
            "memory limit",
            "cuda error",
            "no space left",
        ],
    ),
    (
        ErrorKind::Validation,
        &["converge", "validation", "tolerance", "residual", "diverge"],
    ),
    (
        ErrorKind::Transient,
        &[
            "timeout",
            "timed out",
            "connection",
            "unavailable",
            "network",
            "temporar",
            "broken pipe",
        ],
    ),
];

impl ErrorKind {
    /// Classify from an optional machine code first, then from the message.
    pub fn classify(message: &str, code: Option<&str>) -> Self {
        if let Some(code) = code {
            let code = code.trim().to_ascii_lowercase();
            if let Some((_, kind)) = CODE_TABLE.iter().find(|(c, _)| *c == code) {
                return *kind;
            }
        }

        let message = message.to_ascii_lowercase();
        MESSAGE_TABLE
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| message.contains(n)))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Transient => Severity::Low,
            ErrorKind::Validation => Severity::Medium,
            ErrorKind::ResourceExhaustion | ErrorKind::Unknown => Severity::High,
            ErrorKind::Configuration | ErrorKind::Fatal => Severity::Critical,
        }
    }

    /// Whether blindly re-running the same step can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Validation | ErrorKind::Unknown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step: String,
    pub message: String,
    pub code: Option<String>,
    pub severity: Severity,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn classify(
        step: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let message = message.into();
        let kind = ErrorKind::classify(&message, code.as_deref());
        Self {
            step: step.into(),
            severity: kind.severity(),
            message,
            code,
            kind,
            timestamp,
        }
    }
}

/// Everything one workflow run knows about itself. Owned by a single
/// executor and handed to the router by mutable reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    pub statuses: HashMap<String, TaskStatus>,
    pub results: HashMap<String, serde_json::Value>,
    pub errors: Vec<ErrorRecord>,
    /// Retries used by the step routed last.
    pub retry_count: u32,
    /// Retries used per step since its last success.
    pub step_retries: HashMap<String, u32>,
    pub max_retries: u32,
    pub circuit_breaker_open: bool,
    pub failure_count: u32,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub resources: ResourceSnapshot,
    pub execution_metrics: HashMap<String, ExecutionMetrics>,
    pub durations: HashMap<String, Duration>,
    pub path: Vec<String>,
    pub iterations: u32,
}

impl WorkflowState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceSnapshot) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_metrics(mut self, metrics: HashMap<String, ExecutionMetrics>) -> Self {
        self.execution_metrics = metrics;
        self
    }

    pub fn status(&self, step: &str) -> Option<&TaskStatus> {
        self.statuses.get(step)
    }

    /// Store a step's terminal status. Successful results are kept by step
    /// name; failures append a classified error record.
    pub fn record_outcome(
        &mut self,
        step: &str,
        status: TaskStatus,
        duration: Duration,
        now: DateTime<Utc>,
    ) {
        if status.state.is_success() {
            if let Some(result) = &status.result {
                self.results.insert(step.to_string(), result.clone());
            }
        } else if status.is_terminal() {
            let message = status
                .error
                .clone()
                .unwrap_or_else(|| format!("step ended in state {}", status.state));
            let code = status.error_code.clone().or_else(|| {
                (status.state == crate::TaskState::Timeout).then(|| "timeout".to_string())
            });
            self.errors
                .push(ErrorRecord::classify(step, message, code, now));
        }
        self.durations.insert(step.to_string(), duration);
        self.statuses.insert(step.to_string(), status);
    }

    pub fn retries(&self, step: &str) -> u32 {
        self.step_retries.get(step).copied().unwrap_or(0)
    }

    /// Count one more retry of `step` and return the new total.
    pub fn note_retry(&mut self, step: &str) -> u32 {
        let retries = self.step_retries.entry(step.to_string()).or_insert(0);
        *retries += 1;
        self.retry_count = *retries;
        *retries
    }

    pub fn reset_retries(&mut self, step: &str) {
        self.step_retries.remove(step);
        self.retry_count = 0;
    }

    /// Retries spent across every step of the run.
    pub fn total_retries(&self) -> u32 {
        self.step_retries.values().sum()
    }

    /// Most recent error recorded for `step`.
    pub fn last_error(&self, step: &str) -> Option<&ErrorRecord> {
        self.errors.iter().rev().find(|e| e.step == step)
    }
}
