use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Historical counters for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_count: u64,
    pub failure_count: u64,
    pub cumulative_duration: Duration,
}

impl ExecutionMetrics {
    pub fn record(&mut self, success: bool, duration: Duration) {
        self.execution_count += 1;
        if !success {
            self.failure_count += 1;
        }
        self.cumulative_duration += duration;
    }

    /// Fraction of successful executions. An unsampled step reports 1.0 so
    /// that adaptive routing explores it.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 1.0;
        }
        (self.execution_count - self.failure_count) as f64 / self.execution_count as f64
    }

    pub fn avg_duration(&self) -> Duration {
        if self.execution_count == 0 {
            return Duration::ZERO;
        }
        self.cumulative_duration
            .div_f64(self.execution_count as f64)
    }
}

/// Metric used by performance-adaptive routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Higher is better.
    SuccessRate,
    /// Lower is better.
    AvgDuration,
}

impl MetricKind {
    pub fn value(&self, metrics: &ExecutionMetrics) -> f64 {
        match self {
            MetricKind::SuccessRate => metrics.success_rate(),
            MetricKind::AvgDuration => metrics.avg_duration().as_secs_f64(),
        }
    }

    /// Orders two candidates so that `Ordering::Less` means `a` is the better
    /// choice. Ties go to the less sampled candidate.
    pub fn compare(&self, a: &ExecutionMetrics, b: &ExecutionMetrics) -> Ordering {
        let (va, vb) = (self.value(a), self.value(b));
        let primary = match self {
            MetricKind::SuccessRate => vb.partial_cmp(&va),
            MetricKind::AvgDuration => va.partial_cmp(&vb),
        }
        .unwrap_or(Ordering::Equal);

        primary.then(a.execution_count.cmp(&b.execution_count))
    }
}

/// Process-wide metrics keyed by step name, shared by concurrently running
/// workflows.
#[derive(Debug, Default)]
pub struct ExecutionMetricsStore {
    inner: Mutex<HashMap<String, ExecutionMetrics>>,
}

impl ExecutionMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, step: &str, success: bool, duration: Duration) -> ExecutionMetrics {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entry(step.to_string()).or_default();
        entry.record(success, duration);
        entry.clone()
    }

    pub fn get(&self, step: &str) -> Option<ExecutionMetrics> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(step).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, ExecutionMetrics> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
