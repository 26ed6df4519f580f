mod compare;
mod config;
mod error;
mod exec;
mod executor;
mod inspector;
mod monitor;
mod report;
mod runner;
mod sampler;
mod server;
mod shutdown;
#[cfg(test)]
mod testing;
mod workload;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::exec::*;
    pub use tracing::{debug, error, info, trace, warn};
}

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::runtime::{Builder, Runtime};
use tracing_subscriber::EnvFilter;

use crate::compare::Comparator;
use crate::config::{Cli, Commands, CompareConfig, MonitorConfig};
use crate::executor::{wait_until_reachable, RequestExecutor};
use crate::inspector::OsInspector;
use crate::monitor::Monitor;
use crate::prelude::*;
use crate::runner::Runner;
use crate::sampler::ResourceSampler;
use crate::server::ServerProcess;
use crate::shutdown::Shutdown;
use crate::workload::Workload;

// How long `compare` waits for the target before giving up
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(
        "{} v{}",
        env!("CARGO_PKG_DESCRIPTION"),
        env!("CARGO_PKG_VERSION")
    );

    let code = match run(cli) {
        Ok(()) => 0,
        Err(Error::Interrupted) => {
            warn!("Stopped by operator");
            0
        }
        Err(err) => {
            error!("{}", err);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    cli.validate()?;

    let shutdown = Shutdown::new();
    let handler = shutdown.clone();
    // first Ctrl+C asks the running stage to stop at its next safe point, the second one exits
    if let Err(e) = ctrlc::set_handler(move || {
        if handler.trigger() {
            std::process::exit(0);
        }
        eprintln!("\nInterrupt received, finishing the current step (press Ctrl+C again to exit now)");
    }) {
        warn!("Error setting Ctrl+C handler: {}", e);
    }

    let runtime = get_runtime(cli.threads)?;
    match cli.command {
        Commands::Compare(args) => {
            let config = args.into_config()?;
            runtime.block_on(run_compare(config, shutdown))
        }
        Commands::Monitor(args) => {
            let config = args.into_config()?;
            runtime.block_on(run_monitor(config, shutdown))
        }
    }
}

/// Creates and returns a new Tokio runtime with the given number of worker threads.
fn get_runtime(threads: usize) -> Result<Runtime> {
    Ok(Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?)
}

async fn run_compare(config: CompareConfig, shutdown: Shutdown) -> Result<()> {
    info!("Checking that {} is reachable", config.base_url);
    wait_until_reachable(&config.base_url, PREFLIGHT_TIMEOUT).await?;

    let mut workload = Workload::new(&config.base_url, &config.path, config.id_max, config.seed);
    let urls = workload.generate(config.total_requests);
    debug!("Generated {} URL(s) with seed {}", urls.len(), config.seed);

    let executor = RequestExecutor::new(config.request_timeout, config.connection_timeout)?;
    let sampler = ResourceSampler::new(Arc::new(OsInspector));
    let runner = Runner::new(
        executor,
        sampler,
        config.target_port,
        config.inter_batch_delay,
        shutdown.clone(),
    );
    let comparator = Comparator::new(
        runner,
        config.parallelism,
        config.inter_run_settle,
        config.thresholds,
        shutdown,
    );

    let result = comparator.compare(&urls).await?;
    result.cold.print(config.summarize);
    result.warm.print(config.summarize);
    result.print();

    if let Some(verdict) = result.memory_verdict {
        info!("Memory verdict: {}", verdict);
    }
    if let Some(verdict) = result.latency_verdict {
        info!("Latency verdict: {}", verdict);
    }
    if let Some(path) = &config.report_path {
        result.write_json(path).await?;
        println!("\nComparison saved to: {}", path.display());
    }
    Ok(())
}

async fn run_monitor(config: MonitorConfig, shutdown: Shutdown) -> Result<()> {
    let executor = RequestExecutor::new(config.request_timeout, config.connection_timeout)?;
    let sampler = ResourceSampler::new(Arc::new(OsInspector));
    let workload = Workload::new(&config.base_url, &config.path, config.id_max, config.seed);
    let mut server = ServerProcess::new(&config.server_command, config.grace)?;

    let mut monitor = Monitor::new(executor, sampler, workload, config, shutdown);
    let path = monitor.run(&mut server).await?;
    debug!("Report written to {}", path.display());
    Ok(())
}
