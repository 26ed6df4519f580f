use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::prelude::*;
use crate::report::{round2, signed, RunReport};
use crate::runner::Runner;
use crate::shutdown::Shutdown;

/// Classification thresholds. The defaults are empirical and carried over as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub leak_factor: f64, // warm growth above cold growth times this is a suspected leak
    pub caching_factor: f64, // warm growth below cold growth times this is good caching
    pub latency_pct: f64, // speedup/slowdown percentage considered significant
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            leak_factor: 1.5,
            caching_factor: 0.5,
            latency_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryVerdict {
    LeakSuspected,
    GoodCaching,
    Consistent,
}

impl fmt::Display for MemoryVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryVerdict::LeakSuspected => "leak-suspected",
            MemoryVerdict::GoodCaching => "good-caching",
            MemoryVerdict::Consistent => "consistent",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyVerdict {
    CacheEffective,
    PerformanceDegradation,
    SimilarPerformance,
}

impl fmt::Display for LatencyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LatencyVerdict::CacheEffective => "cache effective",
            LatencyVerdict::PerformanceDegradation => "performance degradation",
            LatencyVerdict::SimilarPerformance => "similar performance",
        })
    }
}

pub fn classify_memory(cold_delta: f64, warm_delta: f64, thresholds: &Thresholds) -> MemoryVerdict {
    if warm_delta > cold_delta * thresholds.leak_factor {
        MemoryVerdict::LeakSuspected
    } else if warm_delta < cold_delta * thresholds.caching_factor {
        MemoryVerdict::GoodCaching
    } else {
        MemoryVerdict::Consistent
    }
}

pub fn classify_latency(delta_pct: f64, thresholds: &Thresholds) -> LatencyVerdict {
    if delta_pct > thresholds.latency_pct {
        LatencyVerdict::CacheEffective
    } else if delta_pct < -thresholds.latency_pct {
        LatencyVerdict::PerformanceDegradation
    } else {
        LatencyVerdict::SimilarPerformance
    }
}

/// Cold vs warm analysis. Verdicts are independent and absent when their inputs are.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub cold: RunReport,
    pub warm: RunReport,
    pub cold_memory_delta_mb: Option<f64>,
    pub warm_memory_delta_mb: Option<f64>,
    pub latency_delta_pct: Option<f64>, // positive when the warm run was faster
    pub memory_verdict: Option<MemoryVerdict>,
    pub latency_verdict: Option<LatencyVerdict>,
    pub thresholds: Thresholds,
}

impl ComparisonResult {
    pub fn from_runs(cold: RunReport, warm: RunReport, thresholds: Thresholds) -> Self {
        let cold_memory_delta_mb = cold.memory_delta_mb();
        let warm_memory_delta_mb = warm.memory_delta_mb();
        let memory_verdict = match (cold_memory_delta_mb, warm_memory_delta_mb) {
            (Some(c), Some(w)) => Some(classify_memory(c, w, &thresholds)),
            _ => None,
        };

        // classify on the unrounded means; rounding is for the stored field only
        let raw_delta_pct = match (cold.mean_latency_ms(), warm.mean_latency_ms()) {
            (Some(c), Some(w)) if c > 0.0 => Some((c - w) / c * 100.0),
            _ => None,
        };
        let latency_verdict = raw_delta_pct.map(|pct| classify_latency(pct, &thresholds));
        let latency_delta_pct = raw_delta_pct.map(round2);

        ComparisonResult {
            cold,
            warm,
            cold_memory_delta_mb,
            warm_memory_delta_mb,
            latency_delta_pct,
            memory_verdict,
            latency_verdict,
            thresholds,
        }
    }

    pub async fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn print(&self) {
        println!("\nMemory Analysis:");
        let fmt_delta = |delta: Option<f64>| match delta {
            Some(d) => format!("{} MB", signed(d)),
            None => "unavailable".to_string(),
        };
        println!("  Cold run memory change: {}", fmt_delta(self.cold_memory_delta_mb));
        println!("  Warm run memory change: {}", fmt_delta(self.warm_memory_delta_mb));
        match self.memory_verdict {
            Some(MemoryVerdict::LeakSuspected) => {
                println!("  Potential memory leak: warm run used significantly more memory")
            }
            Some(MemoryVerdict::GoodCaching) => {
                println!("  Good caching behaviour: warm run used less memory")
            }
            Some(MemoryVerdict::Consistent) => {
                println!("  Memory usage appears consistent between runs")
            }
            None => println!("  No memory verdict (service memory could not be sampled)"),
        }

        println!("\nPerformance Comparison:");
        let fmt_avg = |report: &RunReport| match report.average_latency_ms() {
            Some(avg) => format!("{:.2}ms per request", avg),
            None => "no successful requests".to_string(),
        };
        println!("  Cold run average: {}", fmt_avg(&self.cold));
        println!("  Warm run average: {}", fmt_avg(&self.warm));
        match (self.latency_verdict, self.latency_delta_pct) {
            (Some(LatencyVerdict::CacheEffective), Some(pct)) => {
                println!("  Cache effective: {:.2}% faster on warm run", pct)
            }
            (Some(LatencyVerdict::PerformanceDegradation), Some(pct)) => {
                println!("  Performance degradation: {:.2}% slower on warm run", pct.abs())
            }
            (Some(LatencyVerdict::SimilarPerformance), Some(pct)) => {
                println!("  Similar performance: {:.2}% difference", pct)
            }
            _ => println!("  No latency verdict (a run had no successful requests)"),
        }
    }
}

/// Runs the same URL sequence twice, cold then warm, and compares the two runs.
pub struct Comparator {
    runner: Runner,
    parallelism: usize,
    settle: Duration, // pause between the cold and the warm run
    thresholds: Thresholds,
    shutdown: Shutdown,
}

impl Comparator {
    pub fn new(
        runner: Runner,
        parallelism: usize,
        settle: Duration,
        thresholds: Thresholds,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            runner,
            parallelism,
            settle,
            thresholds,
            shutdown,
        }
    }

    /// Both runs see exactly `urls`, in order. An interrupt in either run or in the settle
    /// window ends the comparison with [`Error::Interrupted`].
    pub async fn compare(&self, urls: &[String]) -> Result<ComparisonResult> {
        let cold = self.runner.run_batches("Cold run", urls, self.parallelism).await?;
        if cold.interrupted {
            return Err(Error::Interrupted);
        }

        info!("Waiting {:?} before the warm run", self.settle);
        if !self.shutdown.sleep(self.settle).await {
            return Err(Error::Interrupted);
        }
        debug!("No reclaim hint for an out-of-process service; {} cold outcome(s) held", cold.total());

        let warm = self.runner.run_batches("Warm run", urls, self.parallelism).await?;
        if warm.interrupted {
            return Err(Error::Interrupted);
        }

        Ok(ComparisonResult::from_runs(cold, warm, self.thresholds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RequestExecutor, RequestOutcome};
    use crate::report::{BatchResult, RunAccumulator};
    use crate::sampler::ResourceSampler;
    use crate::testing::{snapshot, MockServer, ScriptedInspector};
    use std::sync::Arc;

    fn run(latencies: &[f64], heap_before: f64, heap_after: f64) -> RunReport {
        let outcomes = latencies
            .iter()
            .map(|&latency_ms| RequestOutcome::Success {
                url: "http://h/ad/1".to_string(),
                status: 200,
                latency_ms,
                bytes: 10,
            })
            .collect();
        RunAccumulator::default()
            .fold(BatchResult {
                index: 0,
                outcomes,
                duration: Duration::ZERO,
            })
            .finish(
                "run",
                snapshot(Some(heap_before)),
                snapshot(Some(heap_after)),
                Duration::from_millis(10),
                false,
            )
    }

    #[test]
    fn memory_thresholds() {
        let t = Thresholds::default();
        assert_eq!(classify_memory(10.0, 15.1, &t), MemoryVerdict::LeakSuspected);
        assert_eq!(classify_memory(10.0, 15.0, &t), MemoryVerdict::Consistent);
        assert_eq!(classify_memory(10.0, 5.0, &t), MemoryVerdict::Consistent);
        assert_eq!(classify_memory(10.0, 4.9, &t), MemoryVerdict::GoodCaching);
        assert_eq!(classify_memory(0.0, 0.0, &t), MemoryVerdict::Consistent);
        assert_eq!(classify_memory(0.0, 1.0, &t), MemoryVerdict::LeakSuspected);
    }

    #[test]
    fn latency_thresholds() {
        let t = Thresholds::default();
        assert_eq!(classify_latency(10.01, &t), LatencyVerdict::CacheEffective);
        assert_eq!(classify_latency(10.0, &t), LatencyVerdict::SimilarPerformance);
        assert_eq!(classify_latency(-10.0, &t), LatencyVerdict::SimilarPerformance);
        assert_eq!(classify_latency(-10.01, &t), LatencyVerdict::PerformanceDegradation);
    }

    #[test]
    fn warm_fifteen_percent_faster_is_cache_effective() {
        let result = ComparisonResult::from_runs(
            run(&[100.0, 100.0], 1000.0, 1010.0),
            run(&[85.0, 85.0], 1010.0, 1020.0),
            Thresholds::default(),
        );
        assert_eq!(result.latency_delta_pct, Some(15.0));
        assert_eq!(result.latency_verdict, Some(LatencyVerdict::CacheEffective));
        assert_eq!(result.memory_verdict, Some(MemoryVerdict::Consistent));
    }

    #[test]
    fn warm_fifteen_percent_slower_is_degradation() {
        let result = ComparisonResult::from_runs(
            run(&[100.0], 1000.0, 1010.0),
            run(&[115.0], 1010.0, 1030.0),
            Thresholds::default(),
        );
        assert_eq!(result.latency_delta_pct, Some(-15.0));
        assert_eq!(result.latency_verdict, Some(LatencyVerdict::PerformanceDegradation));
        assert_eq!(result.memory_verdict, Some(MemoryVerdict::LeakSuspected));
    }

    #[test]
    fn latency_boundary_is_judged_before_rounding() {
        // true delta is 10.0033%, which rounds to exactly the threshold
        let result = ComparisonResult::from_runs(
            run(&[100.0, 100.0, 100.0], 1000.0, 1010.0),
            run(&[89.99, 90.0, 90.0], 1010.0, 1020.0),
            Thresholds::default(),
        );
        assert_eq!(result.latency_delta_pct, Some(10.0));
        assert_eq!(result.latency_verdict, Some(LatencyVerdict::CacheEffective));

        let result = ComparisonResult::from_runs(
            run(&[100.0, 100.0, 100.0], 1000.0, 1010.0),
            run(&[110.01, 110.0, 110.0], 1010.0, 1020.0),
            Thresholds::default(),
        );
        assert_eq!(result.latency_delta_pct, Some(-10.0));
        assert_eq!(result.latency_verdict, Some(LatencyVerdict::PerformanceDegradation));
    }

    #[test]
    fn verdicts_are_independent() {
        // faster but growing: both reported, neither overrides the other
        let result = ComparisonResult::from_runs(
            run(&[100.0], 1000.0, 1010.0),
            run(&[50.0], 1010.0, 1040.0),
            Thresholds::default(),
        );
        assert_eq!(result.latency_verdict, Some(LatencyVerdict::CacheEffective));
        assert_eq!(result.memory_verdict, Some(MemoryVerdict::LeakSuspected));
    }

    #[test]
    fn missing_memory_leaves_memory_verdict_empty() {
        let mut cold = run(&[100.0], 1000.0, 1010.0);
        cold.before = snapshot(None);
        let result =
            ComparisonResult::from_runs(cold, run(&[90.0], 1.0, 2.0), Thresholds::default());
        assert_eq!(result.cold_memory_delta_mb, None);
        assert_eq!(result.memory_verdict, None);
        assert!(result.latency_verdict.is_some());
    }

    #[test]
    fn custom_thresholds_apply() {
        let thresholds = Thresholds {
            latency_pct: 20.0,
            ..Thresholds::default()
        };
        let result = ComparisonResult::from_runs(
            run(&[100.0], 0.0, 0.0),
            run(&[85.0], 0.0, 0.0),
            thresholds,
        );
        assert_eq!(result.latency_verdict, Some(LatencyVerdict::SimilarPerformance));
    }

    #[tokio::test]
    async fn compare_replays_identical_urls() {
        let server = MockServer::start().await;
        let urls: Vec<String> = (0..12).map(|i| server.url(&format!("/ad/{}", i))).collect();
        let executor =
            RequestExecutor::new(Duration::from_secs(5), Duration::from_secs(2)).unwrap();
        let sampler = ResourceSampler::new(Arc::new(
            ScriptedInspector::listening(3).with_rss(&[100.0, 110.0, 110.0, 112.0]),
        ));
        let shutdown = Shutdown::new();
        let runner = Runner::new(executor, sampler, server.port(), Duration::ZERO, shutdown.clone());
        let comparator = Comparator::new(runner, 5, Duration::ZERO, Thresholds::default(), shutdown);

        let result = comparator.compare(&urls).await.unwrap();

        let cold: Vec<&str> = result.cold.outcomes.iter().map(|o| o.url()).collect();
        let warm: Vec<&str> = result.warm.outcomes.iter().map(|o| o.url()).collect();
        assert_eq!(cold, warm);
        assert_eq!(server.hits(), 24);
        assert_eq!(result.cold_memory_delta_mb, Some(20.0));
        assert_eq!(result.warm_memory_delta_mb, Some(4.0));
        assert_eq!(result.memory_verdict, Some(MemoryVerdict::GoodCaching));
    }

    #[tokio::test]
    async fn interrupted_comparison_is_reported() {
        let server = MockServer::start().await;
        let executor =
            RequestExecutor::new(Duration::from_secs(5), Duration::from_secs(2)).unwrap();
        let sampler = ResourceSampler::new(Arc::new(ScriptedInspector::without_listener()));
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let runner = Runner::new(executor, sampler, server.port(), Duration::ZERO, shutdown.clone());
        let comparator = Comparator::new(runner, 5, Duration::ZERO, Thresholds::default(), shutdown);

        let err = comparator.compare(&[server.url("/ad/1")]).await.unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }
}
