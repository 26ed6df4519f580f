use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inspector::ProcessInspector;
use crate::prelude::*;
use crate::report::round2;

/// Memory of one process, in megabytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub rss_mb: f64,
    pub heap_total_mb: f64, // VSZ when read from ps
    pub heap_used_mb: Option<f64>,
    pub external_mb: Option<f64>,
}

impl MemoryUsage {
    /// Heap figure used for growth analysis: heap_used when known, RSS otherwise.
    pub fn heap_mb(&self) -> f64 {
        self.heap_used_mb.unwrap_or(self.rss_mb)
    }
}

/// A per-process reading has one value; the system fallback has one value per core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "scope", content = "percent", rename_all = "snake_case")]
pub enum CpuReading {
    Process(f64),
    System(Vec<f64>),
}

impl CpuReading {
    pub fn process_percent(&self) -> Option<f64> {
        match self {
            CpuReading::Process(percent) => Some(*percent),
            CpuReading::System(_) => None,
        }
    }
}

impl std::fmt::Display for CpuReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuReading::Process(percent) => write!(f, "{:.1}%", percent),
            CpuReading::System(cores) => {
                let cores = cores.iter().map(|c| format!("{:.1}", c)).collect::<Vec<_>>();
                write!(f, "system [{}]%", cores.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub pid: Option<u32>, // None when no listener could be resolved
    pub memory: Option<MemoryUsage>,
    pub cpu: CpuReading,
    pub captured_at: DateTime<Utc>,
}

/// Change in memory between two snapshots of the same unit of work. May be negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryDelta {
    pub rss_mb: f64,
    pub heap_total_mb: f64,
    pub heap_used_mb: Option<f64>,
}

impl MemoryDelta {
    pub fn heap_mb(&self) -> f64 {
        self.heap_used_mb.unwrap_or(self.rss_mb)
    }
}

impl ResourceSnapshot {
    pub fn memory_delta(&self, after: &ResourceSnapshot) -> Option<MemoryDelta> {
        let (before, after) = (self.memory.as_ref()?, after.memory.as_ref()?);
        Some(MemoryDelta {
            rss_mb: round2(after.rss_mb - before.rss_mb),
            heap_total_mb: round2(after.heap_total_mb - before.heap_total_mb),
            heap_used_mb: match (before.heap_used_mb, after.heap_used_mb) {
                (Some(b), Some(a)) => Some(round2(a - b)),
                _ => None,
            },
        })
    }

    pub fn heap_total_mb(&self) -> Option<f64> {
        self.memory.as_ref().map(|m| m.heap_total_mb)
    }

    pub fn heap_mb(&self) -> Option<f64> {
        self.memory.as_ref().map(MemoryUsage::heap_mb)
    }
}

/// Takes [`ResourceSnapshot`]s through a [`ProcessInspector`].
#[derive(Clone)]
pub struct ResourceSampler {
    inspector: Arc<dyn ProcessInspector>,
}

impl ResourceSampler {
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self { inspector }
    }

    pub async fn resolve(&self, port: u16) -> Result<u32> {
        self.inspector.resolve_listener(port).await
    }

    /// Memory and CPU of `pid`. Fails only if the memory query fails.
    pub async fn sample(&self, pid: u32) -> Result<ResourceSnapshot> {
        let memory = self.inspector.memory(pid).await?;
        let cpu = self.cpu(Some(pid)).await;
        Ok(ResourceSnapshot {
            pid: Some(pid),
            memory: Some(memory),
            cpu,
            captured_at: Utc::now(),
        })
    }

    /// CPU of `pid`, or of the whole system when the pid is unknown or has no row.
    pub async fn cpu(&self, pid: Option<u32>) -> CpuReading {
        if let Some(pid) = pid {
            match self.inspector.process_cpu(pid).await {
                Ok(Some(percent)) => return CpuReading::Process(percent),
                Ok(None) => debug!("No CPU row for pid {}, using system-wide CPU", pid),
                Err(e) => warn!("CPU query for pid {} failed: {}", pid, e),
            }
        }
        CpuReading::System(self.inspector.system_cpu().await)
    }

    /// Snapshot of whatever listens on `port`. Never fails: an unresolvable port or a
    /// failed memory query yields a snapshot without memory and with system-wide CPU.
    pub async fn sample_port(&self, port: u16) -> ResourceSnapshot {
        let pid = match self.resolve(port).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!("{}; sampling system-wide CPU only", e);
                return self.cpu_only(None).await;
            }
        };

        match self.sample(pid).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Memory query for pid {} failed: {}", pid, e);
                self.cpu_only(Some(pid)).await
            }
        }
    }

    async fn cpu_only(&self, pid: Option<u32>) -> ResourceSnapshot {
        ResourceSnapshot {
            pid,
            memory: None,
            cpu: self.cpu(pid).await,
            captured_at: Utc::now(),
        }
    }
}
