use crate::JoinMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where a routing decision sends the workflow next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Step(String),
    /// Terminal sentinel: the workflow finished successfully.
    Complete,
    /// Terminal sentinel: the workflow failed.
    Abort,
}

impl Target {
    pub fn step(name: impl Into<String>) -> Self {
        Target::Step(name.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Target::Complete | Target::Abort)
    }

    pub fn step_name(&self) -> Option<&str> {
        match self {
            Target::Step(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Step(name) => f.write_str(name),
            Target::Complete => f.write_str("<complete>"),
            Target::Abort => f.write_str("<abort>"),
        }
    }
}

/// Which routing strategy produced a decision, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    CircuitBreaker,
    Success,
    RetryBackoff,
    ErrorSeverity,
    Conditional,
    Priority,
    ResourceAware,
    Adaptive,
    ParallelSplit,
}

/// Fan-out request carried by a parallel-split decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelSplit {
    pub branches: Vec<String>,
    pub join: String,
    pub mode: JoinMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub next: Target,
    pub strategy: RoutingStrategy,
    pub reason: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<ParallelSplit>,
}

impl RoutingDecision {
    pub fn new(next: Target, strategy: RoutingStrategy, reason: impl Into<String>) -> Self {
        Self {
            next,
            strategy,
            reason: reason.into(),
            metadata: serde_json::Map::new(),
            fallbacks: Vec::new(),
            join_target: None,
            split: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_join(mut self, join: impl Into<String>) -> Self {
        self.join_target = Some(join.into());
        self
    }

    pub fn with_split(mut self, split: ParallelSplit) -> Self {
        self.join_target = Some(split.join.clone());
        self.split = Some(split);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.split.is_none() && self.next.is_terminal()
    }

    /// Backoff attached by the retry strategy.
    pub fn backoff(&self) -> Option<Duration> {
        self.metadata
            .get("backoff_seconds")
            .and_then(|v| v.as_f64())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}
