use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Gpu => "gpu",
        })
    }
}

/// Current usage against a limit, in the resource's own unit
/// (cores, MB, devices).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used: f64,
    pub limit: f64,
}

impl ResourceUsage {
    pub fn new(used: f64, limit: f64) -> Self {
        Self { used, limit }
    }

    pub fn available(&self) -> f64 {
        (self.limit - self.used).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    #[serde(default)]
    pub cpu: ResourceUsage,
    #[serde(default)]
    pub memory: ResourceUsage,
    #[serde(default)]
    pub gpu: ResourceUsage,
}

impl ResourceSnapshot {
    pub fn usage(&self, kind: ResourceKind) -> ResourceUsage {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Gpu => self.gpu,
        }
    }

    pub fn available(&self, kind: ResourceKind) -> f64 {
        self.usage(kind).available()
    }

    pub fn with(mut self, kind: ResourceKind, used: f64, limit: f64) -> Self {
        let usage = ResourceUsage::new(used, limit);
        match kind {
            ResourceKind::Cpu => self.cpu = usage,
            ResourceKind::Memory => self.memory = usage,
            ResourceKind::Gpu => self.gpu = usage,
        }
        self
    }
}

/// Source of resource snapshots, typically an external profiler.
pub trait ResourceProfiler: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Profiler that always reports the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiler(pub ResourceSnapshot);

impl ResourceProfiler for StaticProfiler {
    fn snapshot(&self) -> ResourceSnapshot {
        self.0
    }
}
