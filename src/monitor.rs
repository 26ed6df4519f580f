use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::executor::{wait_until_reachable, RequestExecutor, RequestOutcome};
use crate::prelude::*;
use crate::report::{round2, signed};
use crate::sampler::{MemoryDelta, ResourceSampler, ResourceSnapshot};
use crate::server::ServerProcess;
use crate::shutdown::Shutdown;
use crate::workload::Workload;

/// One sequential measurement of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfTestResult {
    pub item_id: u32,
    pub run_number: usize,
    pub load_time_ms: f64, // -1 when the request failed
    pub content_size: usize,
    pub before: ResourceSnapshot,
    pub after: ResourceSnapshot, // equals `before` when the request failed
    pub memory_delta: Option<MemoryDelta>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl PerfTestResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.load_time_ms >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakMemory {
    High,
    Reasonable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalMemoryUsage {
    pub initial_heap_mb: Option<f64>,
    pub final_heap_mb: Option<f64>,
    pub peak_heap_mb: Option<f64>,
    pub avg_heap_per_item_mb: Option<f64>,
    pub heap_growth_mb: Option<f64>, // final - initial
    pub peak_increase_mb: Option<f64>, // peak - initial
    pub peak_memory: Option<PeakMemory>,
}

/// Aggregates over the successful results of a monitor run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfTestSummary {
    pub total_items: usize, // distinct ids that loaded
    pub total_runs: usize, // successful measurements
    pub failed_runs: usize,
    pub avg_load_time_ms: f64,
    pub min_load_time_ms: f64,
    pub max_load_time_ms: f64,
    pub avg_content_size: f64,
    pub total_memory_delta_mb: f64,
    pub avg_cpu_percent: f64, // over per-process readings above zero
    pub global_memory: GlobalMemoryUsage,
}

/// The report artifact.
#[derive(Debug, Clone, Serialize)]
pub struct PerfReport {
    pub generated_at: DateTime<Utc>,
    pub target: String,
    pub baseline: ResourceSnapshot,
    pub final_snapshot: ResourceSnapshot,
    pub summary: Option<PerfTestSummary>, // None when no item loaded
    pub results: Vec<PerfTestResult>,
}

/// Aggregate a result list. Pure: the same inputs always give the same numbers.
pub fn summarize(
    results: &[PerfTestResult],
    baseline: &ResourceSnapshot,
    final_snapshot: &ResourceSnapshot,
    high_memory_threshold_mb: f64,
) -> Option<PerfTestSummary> {
    let valid: Vec<&PerfTestResult> = results.iter().filter(|r| r.is_success()).collect();
    if valid.is_empty() {
        return None;
    }
    let count = valid.len() as f64;

    let load_times: Vec<f64> = valid.iter().map(|r| r.load_time_ms).collect();
    let min_load_time_ms = load_times.iter().copied().fold(f64::INFINITY, f64::min);
    let max_load_time_ms = load_times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg_load_time_ms = round2(load_times.iter().sum::<f64>() / count);
    let avg_content_size = round2(valid.iter().map(|r| r.content_size as f64).sum::<f64>() / count);
    let total_memory_delta_mb = round2(
        valid
            .iter()
            .filter_map(|r| r.memory_delta.as_ref())
            .map(MemoryDelta::heap_mb)
            .sum(),
    );

    let cpu: Vec<f64> = valid
        .iter()
        .filter_map(|r| r.after.cpu.process_percent())
        .filter(|&percent| percent > 0.0)
        .collect();
    let avg_cpu_percent = if cpu.is_empty() {
        0.0
    } else {
        round2(cpu.iter().sum::<f64>() / cpu.len() as f64)
    };

    let heaps: Vec<f64> = valid.iter().filter_map(|r| r.after.heap_mb()).collect();
    let initial_heap_mb = baseline.heap_mb();
    let final_heap_mb = final_snapshot.heap_mb();
    let peak_heap_mb = heaps.iter().copied().reduce(f64::max);
    let avg_heap_per_item_mb = if heaps.is_empty() {
        None
    } else {
        Some(round2(heaps.iter().sum::<f64>() / heaps.len() as f64))
    };
    let heap_growth_mb = diff(final_heap_mb, initial_heap_mb);
    let peak_increase_mb = diff(peak_heap_mb, initial_heap_mb);
    let peak_memory = peak_increase_mb.map(|increase| {
        if increase > high_memory_threshold_mb {
            PeakMemory::High
        } else {
            PeakMemory::Reasonable
        }
    });

    Some(PerfTestSummary {
        total_items: valid.iter().map(|r| r.item_id).collect::<HashSet<_>>().len(),
        total_runs: valid.len(),
        failed_runs: results.len() - valid.len(),
        avg_load_time_ms,
        min_load_time_ms,
        max_load_time_ms,
        avg_content_size,
        total_memory_delta_mb,
        avg_cpu_percent,
        global_memory: GlobalMemoryUsage {
            initial_heap_mb,
            final_heap_mb,
            peak_heap_mb,
            avg_heap_per_item_mb,
            heap_growth_mb,
            peak_increase_mb,
            peak_memory,
        },
    })
}

fn diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(round2(a? - b?))
}

/// Loads distinct items one at a time against a service it starts and stops itself,
/// attributing each resource change to a single item.
pub struct Monitor {
    executor: RequestExecutor,
    sampler: ResourceSampler,
    workload: Workload,
    config: MonitorConfig,
    shutdown: Shutdown,
}

impl Monitor {
    pub fn new(
        executor: RequestExecutor,
        sampler: ResourceSampler,
        workload: Workload,
        config: MonitorConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            executor,
            sampler,
            workload,
            config,
            shutdown,
        }
    }

    /// Start the server, measure, write the report, and stop the server whatever happened.
    pub async fn run(&mut self, server: &mut ServerProcess) -> Result<PathBuf> {
        server.start()?;
        debug!("Server pid: {:?}", server.pid());
        let outcome = self.measure().await;
        match server.stop().await {
            Ok(stop) => debug!("Server stopped: {:?}", stop),
            Err(e) => warn!("Failed to stop server: {}", e),
        }
        outcome
    }

    async fn measure(&mut self) -> Result<PathBuf> {
        info!("Waiting for {} to accept connections", self.config.base_url);
        tokio::select! {
            ready = wait_until_reachable(&self.config.base_url, self.config.startup_timeout) => ready?,
            _ = self.shutdown.cancelled() => return Err(Error::Interrupted),
        }

        let baseline = self.sampler.sample_port(self.config.target_port).await;
        if let Some(heap) = baseline.heap_mb() {
            info!("Starting test with initial heap: {:.2}MB", heap);
        }

        let ids = self.workload.unique_ids(self.config.unique_item_count)?;
        info!("Testing {} different ids: {:?}", ids.len(), ids);

        let results = self.measure_items(&ids).await?;
        let final_snapshot = self.sampler.sample_port(self.config.target_port).await;

        let summary = summarize(
            &results,
            &baseline,
            &final_snapshot,
            self.config.high_memory_threshold_mb,
        );
        match &summary {
            Some(summary) => print_summary(summary, results.len(), self.config.high_memory_threshold_mb),
            None => warn!("No valid results to analyze"),
        }

        let report = PerfReport {
            generated_at: Utc::now(),
            target: format!("{}/{}", self.config.base_url.trim_end_matches('/'), self.config.path),
            baseline,
            final_snapshot,
            summary,
            results,
        };
        let path = write_report(&report, &self.config.output_dir).await?;
        println!("\nResults saved to: {}", path.display());
        Ok(path)
    }

    /// Measure each id in order, strictly one at a time.
    pub async fn measure_items(&self, ids: &[u32]) -> Result<Vec<PerfTestResult>> {
        let mut results = Vec::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            if self.shutdown.is_requested() {
                return Err(Error::Interrupted);
            }
            info!("--- Testing item {} ({}/{}) ---", id, i + 1, ids.len());
            results.push(self.measure_item(id, i + 1).await);

            if i + 1 < ids.len() && !self.shutdown.sleep(self.config.inter_item_delay).await {
                return Err(Error::Interrupted);
            }
        }
        Ok(results)
    }

    async fn measure_item(&self, item_id: u32, run_number: usize) -> PerfTestResult {
        let url = self.workload.url_for(item_id);
        let before = self.sampler.sample_port(self.config.target_port).await;

        match self.executor.execute(&url).await {
            RequestOutcome::Success { latency_ms, bytes, .. } => {
                // an interrupt only shortens the settle; the after-sample still pairs up
                self.shutdown.sleep(self.config.post_request_settle).await;
                let after = self.sampler.sample_port(self.config.target_port).await;
                let memory_delta = before.memory_delta(&after);

                info!("Loaded in {:.2}ms ({}KB)", latency_ms, bytes / 1024);
                info!("CPU: {} -> {}", before.cpu, after.cpu);
                if let Some(delta) = &memory_delta {
                    info!("Memory delta: RSS {} MB, heap {} MB", signed(delta.rss_mb), signed(delta.heap_mb()));
                }

                PerfTestResult {
                    item_id,
                    run_number,
                    load_time_ms: latency_ms,
                    content_size: bytes,
                    after,
                    before,
                    memory_delta,
                    timestamp: Utc::now(),
                    error: None,
                }
            }
            RequestOutcome::Failure { reason, .. } => {
                warn!("Failed to load item {}: {}", item_id, reason);
                PerfTestResult {
                    item_id,
                    run_number,
                    load_time_ms: -1.0,
                    content_size: 0,
                    after: before.clone(),
                    before,
                    memory_delta: None,
                    timestamp: Utc::now(),
                    error: Some(reason),
                }
            }
        }
    }
}

/// Write the report as `performance-report-<unix ms>.json` under `dir`.
pub async fn write_report(report: &PerfReport, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!(
        "performance-report-{}.json",
        report.generated_at.timestamp_millis()
    ));
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}

fn print_summary(summary: &PerfTestSummary, total_results: usize, threshold_mb: f64) {
    let opt = |value: Option<f64>| match value {
        Some(v) => format!("{:.2}MB", v),
        None => "n/a".to_string(),
    };
    let memory = &summary.global_memory;

    println!("\nGLOBAL PERFORMANCE REPORT");
    println!("{}", "=".repeat(60));
    println!("Total unique items tested: {}", summary.total_items);
    println!("Successful runs:           {}/{}", summary.total_runs, total_results);
    println!("Average load time:         {:.2}ms", summary.avg_load_time_ms);
    println!("Min load time:             {:.2}ms", summary.min_load_time_ms);
    println!("Max load time:             {:.2}ms", summary.max_load_time_ms);
    println!("Average CPU usage:         {:.1}%", summary.avg_cpu_percent);
    println!("Average content size:      {:.0}KB", summary.avg_content_size / 1024.0);
    println!("Total memory delta:        {}MB", signed(summary.total_memory_delta_mb));

    println!("\nGLOBAL MEMORY USAGE ANALYSIS");
    println!("Initial heap:              {}", opt(memory.initial_heap_mb));
    println!("Final heap:                {}", opt(memory.final_heap_mb));
    println!("Peak heap:                 {}", opt(memory.peak_heap_mb));
    println!("Average heap per item:     {}", opt(memory.avg_heap_per_item_mb));
    println!("Total heap growth:         {}", opt(memory.heap_growth_mb));
    match (memory.peak_memory, memory.peak_increase_mb) {
        (Some(PeakMemory::High), Some(increase)) => println!(
            "High peak memory usage ({:.2}MB above baseline, threshold {:.0}MB)",
            increase, threshold_mb
        ),
        (Some(PeakMemory::Reasonable), Some(increase)) => {
            println!("Reasonable peak memory usage ({:.2}MB above baseline)", increase)
        }
        _ => println!("Peak memory could not be assessed"),
    }
}
