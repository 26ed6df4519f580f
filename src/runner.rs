use std::ops::Range;
use std::time::{Duration, Instant};

use crate::executor::RequestExecutor;
use crate::prelude::*;
use crate::report::{round2, BatchResult, RunAccumulator, RunReport};
use crate::sampler::ResourceSampler;
use crate::shutdown::Shutdown;

/// Drives a URL sequence through fixed-width fan-out batches and brackets the whole run
/// with a pair of resource snapshots of the process listening on `target_port`.
#[derive(Clone)]
pub struct Runner {
    executor: RequestExecutor, // shared client for sending requests
    sampler: ResourceSampler,
    target_port: u16,
    inter_batch_delay: Duration, // pause between batches so memory changes are observable
    shutdown: Shutdown,
}

impl Runner {
    /*------------------==| Public Functions |==-------------------------*/
    pub fn new(
        executor: RequestExecutor,
        sampler: ResourceSampler,
        target_port: u16,
        inter_batch_delay: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            executor,
            sampler,
            target_port,
            inter_batch_delay,
            shutdown,
        }
    }

    /// Run every URL once, `width` at a time.
    ///
    /// Batch N+1 starts only after every request of batch N settled. The operator interrupt
    /// is honoured between batches; the closing snapshot is taken either way.
    pub async fn run_batches(&self, label: &str, urls: &[String], width: usize) -> Result<RunReport> {
        if width == 0 {
            return Err(Error::Config("batch width must be at least 1".to_string()));
        }
        let ranges = batch_ranges(urls.len(), width);
        let total_batches = ranges.len();
        info!(
            "Starting {}: {} request(s), {} in parallel, {} batch(es)",
            label,
            urls.len(),
            width,
            total_batches
        );

        let before = self.sampler.sample_port(self.target_port).await;
        Self::log_snapshot("Initial", &before);

        let start = Instant::now();
        let mut acc = RunAccumulator::with_capacity(urls.len());
        let mut interrupted = false;

        for (index, range) in ranges.into_iter().enumerate() {
            if self.shutdown.is_requested() {
                interrupted = true;
                break;
            }

            let batch = self.run_batch(index, &urls[range]).await?;
            info!(
                "Batch {}/{}: {} successful, {} failed in {:.2}ms",
                index + 1,
                total_batches,
                batch.successful(),
                batch.failed(),
                round2(batch.duration.as_secs_f64() * 1000.0)
            );
            acc = acc.fold(batch);

            if index + 1 < total_batches && !self.shutdown.sleep(self.inter_batch_delay).await {
                interrupted = true;
                break;
            }
        }

        let elapsed = start.elapsed();
        let after = self.sampler.sample_port(self.target_port).await;
        Self::log_snapshot("Final", &after);

        if interrupted {
            warn!("{} interrupted after {} request(s)", label, acc.requests());
        }
        Ok(acc.finish(label, before, after, elapsed, interrupted))
    }

    /*-------------------==| Private/Helpers |==----------------------- */

    /// Launch every request of the batch at once and collect the outcomes in launch order.
    async fn run_batch(&self, index: usize, urls: &[String]) -> Result<BatchResult> {
        let start = Instant::now();
        let mut handles = Vec::with_capacity(urls.len());
        for url in urls {
            let executor = self.executor.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move { executor.execute(&url).await }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await?); // a panicked request task is a harness fault
        }
        Ok(BatchResult {
            index,
            outcomes,
            duration: start.elapsed(),
        })
    }

    fn log_snapshot(when: &str, snapshot: &crate::sampler::ResourceSnapshot) {
        match &snapshot.memory {
            Some(memory) => info!(
                "{} memory: RSS {:.2} MB, heap total {:.2} MB, CPU {}",
                when,
                memory.rss_mb,
                memory.heap_total_mb,
                snapshot.cpu
            ),
            None => info!("{} memory: unavailable, CPU {}", when, snapshot.cpu),
        }
    }
}

/// Consecutive index ranges of at most `width` covering `0..total`.
pub fn batch_ranges(total: usize, width: usize) -> Vec<Range<usize>> {
    if width == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(width)
        .map(|start| start..(start + width).min(total))
        .collect()
}
