use crate::{CircuitBreakerConfig, MetricKind, ResourceKind, Target, TaskSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Directed graph of named steps. Cycles (retry-to-self, refine-to-earlier)
/// are allowed; the executor bounds them with an iteration cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub steps: Vec<StepSpec>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            start: start.into(),
            max_retries: None,
            context: serde_json::Map::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub task: TaskSpec,
    #[serde(default)]
    pub edges: StepEdges,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, task: TaskSpec) -> Self {
        Self {
            name: name.into(),
            task,
            edges: StepEdges::default(),
            timeout_secs: None,
        }
    }

    pub fn then(self, target: impl Into<String>) -> Self {
        self.on_success(SuccessRoute::Next {
            target: Target::Step(target.into()),
        })
    }

    pub fn on_success(mut self, route: SuccessRoute) -> Self {
        self.edges.on_success = route;
        self
    }

    pub fn on_error(mut self, step: impl Into<String>) -> Self {
        self.edges.on_error = Some(step.into());
        self
    }

    pub fn continuation(mut self, step: impl Into<String>) -> Self {
        self.edges.continuation = Some(step.into());
        self
    }

    pub fn fallback(mut self, step: impl Into<String>) -> Self {
        self.edges.fallbacks.push(step.into());
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.edges.retry = false;
        self
    }

    pub fn with_circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.edges.circuit = Some(config);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Outgoing edges of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEdges {
    #[serde(default)]
    pub on_success: SuccessRoute,
    /// Terminal/error edge taken on critical failures.
    #[serde(default)]
    pub on_error: Option<String>,
    /// Where low/medium severity failures continue with a warning.
    #[serde(default)]
    pub continuation: Option<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default = "default_retry")]
    pub retry: bool,
    #[serde(default)]
    pub circuit: Option<CircuitBreakerConfig>,
}

fn default_retry() -> bool {
    true
}

impl Default for StepEdges {
    fn default() -> Self {
        Self {
            on_success: SuccessRoute::default(),
            on_error: None,
            continuation: None,
            fallbacks: Vec::new(),
            retry: true,
            circuit: None,
        }
    }
}

impl StepEdges {
    /// Every step name these edges can route to.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        out.extend(self.on_success.targets());
        out.extend(self.on_error.as_deref());
        out.extend(self.continuation.as_deref());
        out.extend(self.fallbacks.iter().map(String::as_str));
        out
    }
}

/// Success-side routing strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SuccessRoute {
    Next {
        target: Target,
    },
    /// Route on a field of the step's result payload.
    Conditional {
        field: String,
        routes: BTreeMap<String, Target>,
        default: Target,
    },
    /// First matching rule over the workflow context wins.
    Priority {
        rules: Vec<ContextRule>,
        default: Target,
    },
    Resource {
        resource: ResourceKind,
        threshold: f64,
        intensive: Target,
        lightweight: Target,
    },
    Adaptive {
        candidates: Vec<String>,
        metric: MetricKind,
    },
    Parallel {
        branches: Vec<String>,
        join: String,
        #[serde(default)]
        mode: JoinMode,
    },
}

impl Default for SuccessRoute {
    fn default() -> Self {
        SuccessRoute::Next {
            target: Target::Complete,
        }
    }
}

impl SuccessRoute {
    pub fn targets(&self) -> Vec<&str> {
        fn name(t: &Target) -> Option<&str> {
            t.step_name()
        }
        match self {
            SuccessRoute::Next { target } => name(target).into_iter().collect(),
            SuccessRoute::Conditional { routes, default, .. } => routes
                .values()
                .chain(std::iter::once(default))
                .filter_map(name)
                .collect(),
            SuccessRoute::Priority { rules, default } => rules
                .iter()
                .map(|r| &r.target)
                .chain(std::iter::once(default))
                .filter_map(name)
                .collect(),
            SuccessRoute::Resource {
                intensive,
                lightweight,
                ..
            } => [intensive, lightweight].into_iter().filter_map(name).collect(),
            SuccessRoute::Adaptive { candidates, .. } => {
                candidates.iter().map(String::as_str).collect()
            }
            SuccessRoute::Parallel { branches, join, .. } => branches
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(join.as_str()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Proceed once every branch succeeded.
    #[default]
    All,
    /// Proceed on the first successful branch.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRule {
    pub key: String,
    pub predicate: Predicate,
    pub target: Target,
}

impl ContextRule {
    pub fn new(key: impl Into<String>, predicate: Predicate, target: Target) -> Self {
        Self {
            key: key.into(),
            predicate,
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    Exists,
    Equals(serde_json::Value),
    NotEquals(serde_json::Value),
    GreaterThan(f64),
    LessThan(f64),
    OneOf(Vec<serde_json::Value>),
}

impl Predicate {
    pub fn matches(&self, value: Option<&serde_json::Value>) -> bool {
        match (self, value) {
            (Predicate::Exists, v) => v.is_some_and(|v| !v.is_null()),
            (Predicate::NotEquals(expected), v) => v != Some(expected),
            (_, None) => false,
            (Predicate::Equals(expected), Some(v)) => v == expected,
            (Predicate::GreaterThan(bound), Some(v)) => v.as_f64().is_some_and(|n| n > *bound),
            (Predicate::LessThan(bound), Some(v)) => v.as_f64().is_some_and(|n| n < *bound),
            (Predicate::OneOf(options), Some(v)) => options.contains(v),
        }
    }
}
