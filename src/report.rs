use std::time::Duration;

use serde::Serialize;

use crate::executor::RequestOutcome;
use crate::sampler::ResourceSnapshot;

const FIELD_WIDTH: usize = 24; //  width of each field for formatting print
const BUCKET_COUNT: usize = 10; // size of the histogram

/// Round to two decimals, the precision every figure in the reports is kept at.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Outcomes of one fan-out, in launch order.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub index: usize,
    pub outcomes: Vec<RequestOutcome>,
    pub duration: Duration,
}

impl BatchResult {
    pub fn successful(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.successful()
    }
}

/// Running fold of [`BatchResult`]s into the data a [`RunReport`] needs.
#[derive(Debug, Default)]
pub struct RunAccumulator {
    outcomes: Vec<RequestOutcome>,
    batches: usize,
}

impl RunAccumulator {
    pub fn with_capacity(requests: usize) -> Self {
        Self {
            outcomes: Vec::with_capacity(requests),
            batches: 0,
        }
    }

    pub fn fold(mut self, batch: BatchResult) -> Self {
        self.outcomes.extend(batch.outcomes);
        self.batches += 1;
        self
    }

    pub fn requests(&self) -> usize {
        self.outcomes.len()
    }

    pub fn finish(
        self,
        label: &str,
        before: ResourceSnapshot,
        after: ResourceSnapshot,
        elapsed: Duration,
        interrupted: bool,
    ) -> RunReport {
        let total_time_ms = round2(elapsed.as_secs_f64() * 1000.0);
        let avg_request_time_ms = if self.outcomes.is_empty() {
            0.0
        } else {
            round2(total_time_ms / self.outcomes.len() as f64)
        };
        RunReport {
            label: label.to_string(),
            before,
            after,
            outcomes: self.outcomes,
            batches: self.batches,
            total_time_ms,
            avg_request_time_ms,
            interrupted,
        }
    }
}

/// Summary of one full load run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub label: String,
    pub before: ResourceSnapshot, // taken once before the first batch
    pub after: ResourceSnapshot, // taken once after the last batch
    pub outcomes: Vec<RequestOutcome>,
    pub batches: usize,
    pub total_time_ms: f64, // wall clock of the whole run
    pub avg_request_time_ms: f64, // wall clock divided by requests issued
    pub interrupted: bool, // stopped early by the operator
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn successful(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.successful()
    }

    pub fn timeouts(&self) -> usize {
        self.outcomes.iter().filter(|o| o.timed_out()).count()
    }

    /// Bytes read from successful responses.
    pub fn total_bytes(&self) -> usize {
        self.outcomes.iter().map(RequestOutcome::bytes).sum()
    }

    /// Latencies of successful requests, sorted ascending.
    pub fn sorted_latencies(&self) -> Vec<f64> {
        let mut latencies: Vec<f64> =
            self.outcomes.iter().filter_map(RequestOutcome::success_latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));
        latencies
    }

    /// Mean latency over successful requests only, unrounded. `None` if nothing succeeded.
    pub fn mean_latency_ms(&self) -> Option<f64> {
        let latencies: Vec<f64> =
            self.outcomes.iter().filter_map(RequestOutcome::success_latency_ms).collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    }

    /// [`RunReport::mean_latency_ms`] rounded for display.
    pub fn average_latency_ms(&self) -> Option<f64> {
        self.mean_latency_ms().map(round2)
    }

    /// Growth of heap_total (VSZ) across the run.
    pub fn memory_delta_mb(&self) -> Option<f64> {
        Some(round2(self.after.heap_total_mb()? - self.before.heap_total_mb()?))
    }

    pub fn requests_per_sec(&self) -> f64 {
        if self.total_time_ms <= 0.0 {
            return 0.0;
        }
        self.total() as f64 / (self.total_time_ms / 1000.0)
    }

    /*---------= Everything related to printing =----------*/
    pub fn print(&self, summarize: bool) {
        println!();
        if summarize {
            self.print_summarized();
        } else {
            self.print_full();
        }
    }

    fn print_summarized(&self) {
        println!(
            "{}: sent {} requests in {:.2}s, {:.3}KB read",
            self.label,
            self.total(),
            self.total_time_ms / 1000.0,
            self.total_bytes() as f64 / 1024.0
        );
        if self.failed() > 0 {
            println!(
                "Failed Requests: {}, out of which timeouts {}",
                self.failed(),
                self.timeouts()
            );
        }
        let latencies = self.sorted_latencies();
        print_request_timings(&latencies);
        print_latency_distribution(&latencies);
        print_memory(self);
    }

    fn print_full(&self) {
        let field_width = FIELD_WIDTH;
        println!("== {} ==", self.label);
        println!("{:<field_width$}{}", "Batches:", self.batches);
        println!("{:<field_width$}{}", "Successful Requests:", self.successful());
        if self.failed() > 0 {
            println!("{:<field_width$}{} (including timeouts)", "Failed Requests:", self.failed());
            println!("{:<field_width$}{}", "Timeouts:", self.timeouts());
        }
        println!("{:<field_width$}{:.2}", "Requests/sec:", self.requests_per_sec());
        println!("{:<field_width$}{:.4} KB", "Total Read:", self.total_bytes() as f64 / 1024.0);
        println!("{:<field_width$}{:.2}ms", "Total Time Taken:", self.total_time_ms);
        println!("{:<field_width$}{:.2}ms", "Time per Request:", self.avg_request_time_ms);
        if self.interrupted {
            println!("{:<field_width$}yes", "Interrupted:");
        }
        println!();

        let latencies = self.sorted_latencies();
        print_request_timings(&latencies);
        println!();
        print_latency_distribution(&latencies);
        println!();
        print_latency_histogram(&latencies);
        println!();
        print_memory(self);
    }
}

/// Value at index `floor(p / 100 * n)` of the sorted latencies, clamped to the last one.
pub fn percentile(sorted_ms: &[f64], p: f64) -> Option<f64> {
    if sorted_ms.is_empty() {
        return None;
    }
    let idx = ((p / 100.0) * (sorted_ms.len() as f64)) as usize;
    Some(sorted_ms[idx.min(sorted_ms.len() - 1)])
}

/// Counts of latencies per equal-width bucket from 0 to the maximum.
pub fn histogram(sorted_ms: &[f64]) -> Vec<(f64, f64, usize)> {
    let max = match sorted_ms.last() {
        Some(&max) if max > 0.0 => max,
        Some(_) => return vec![(0.0, 0.0, sorted_ms.len())],
        None => return Vec::new(),
    };
    let bucket_size = max / (BUCKET_COUNT as f64);

    let mut counts = vec![0; BUCKET_COUNT];
    for &latency in sorted_ms {
        let bucket = (latency / bucket_size).min((BUCKET_COUNT - 1) as f64) as usize;
        counts[bucket] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| ((i as f64) * bucket_size, ((i as f64) + 1.0) * bucket_size, count))
        .collect()
}

// convert into seconds if the value is greater than 1000ms
pub fn format_latency(value: f64) -> String {
    if value > 1000.0 {
        format!("{:.2}s", value / 1000.0)
    } else {
        format!("{:.2}ms", value)
    }
}

/// Prefix a delta with `+` when it grew.
pub fn signed(value: f64) -> String {
    if value > 0.0 {
        format!("+{:.2}", value)
    } else {
        format!("{:.2}", value)
    }
}

fn print_request_timings(latencies_ms: &[f64]) {
    let (Some(min), Some(max)) = (latencies_ms.first(), latencies_ms.last()) else {
        println!("No successful requests");
        return;
    };
    let mean = latencies_ms.iter().sum::<f64>() / (latencies_ms.len() as f64);
    let variance: f64 = latencies_ms
        .iter()
        .map(|&value| (value - mean).powi(2))
        .sum::<f64>() / (latencies_ms.len() as f64);

    println!("Latency Stats (successful requests):");
    println!(" {:<10} {:<10} {:<10} {:<10}", "Avg", "Min", "Max", "Stdev");
    println!(
        " {:<10} {:<10} {:<10} {:<10}",
        format_latency(mean),
        format_latency(*min),
        format_latency(*max),
        format_latency(variance.sqrt())
    );
}

fn print_latency_distribution(latencies_ms: &[f64]) {
    if latencies_ms.is_empty() {
        return; // nothing succeeded
    }
    println!("Latency Distribution:");
    for p in [50.0, 75.0, 90.0, 99.0] {
        if let Some(value) = percentile(latencies_ms, p) {
            println!(" {:<5}  {:.2} ms", format!("{}%", p), value);
        }
    }
}

fn print_latency_histogram(latencies_ms: &[f64]) {
    let buckets = histogram(latencies_ms);
    if buckets.is_empty() {
        return;
    }
    println!("{:<15} {:<15} {:>10}", "Range (ms)", "Upper Bound", "Requests");
    for (lower_bound, upper_bound, count) in buckets {
        println!("{:<15.2} {:<15.2} {:>10}", lower_bound, upper_bound, count);
    }
}

fn print_memory(report: &RunReport) {
    println!("Memory:");
    match (&report.before.memory, &report.after.memory) {
        (Some(before), Some(after)) => {
            println!(
                "  RSS:        {:.2} MB -> {:.2} MB ({} MB)",
                before.rss_mb,
                after.rss_mb,
                signed(after.rss_mb - before.rss_mb)
            );
            println!(
                "  Heap Total: {:.2} MB -> {:.2} MB ({} MB)",
                before.heap_total_mb,
                after.heap_total_mb,
                signed(after.heap_total_mb - before.heap_total_mb)
            );
        }
        _ => println!("  unavailable (no listening process resolved)"),
    }
    println!("  CPU:        {} -> {}", report.before.cpu, report.after.cpu);
}
