use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::compare::Thresholds;
use crate::executor::url_address;
use crate::prelude::*;
use crate::workload::clock_seed;

// Error messages
const ERR_INVALID_REQUESTS: &str = "Invalid number of requests";
const ERR_INVALID_PARALLELISM: &str = "Invalid number of parallel requests";
const ERR_INVALID_REQUESTS_AND_PARALLELISM: &str = "Number of requests must be >= parallelism";
const ERR_INVALID_ITEMS: &str = "Invalid number of items";
const ERR_INVALID_THREADS: &str = "Invalid number of threads";
const ERR_EMPTY_SERVER_COMMAND: &str = "Server command is empty";

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about, after_help = DURATION_HELP)]
pub struct Cli {
    /// Number of runtime worker threads
    #[arg(short = 't', long, default_value_t = 1, global = true)]
    pub threads: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

const DURATION_HELP: &str = "Durations can be specified like: 500ms, 10s, 1m, 1h (bare numbers are seconds)";

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay one URL sequence twice (cold, then warm) and compare latency and memory
    Compare(CompareArgs),
    /// Start the service, load unique items one at a time and write a JSON report
    Monitor(MonitorArgs),
}

#[derive(Debug, Args)]
pub struct CompareArgs {
    /// Base URL of the service under test
    #[arg(long, default_value = "http://localhost:3000")]
    pub base_url: String,
    /// Resource path placed between the base URL and the id
    #[arg(long, default_value = "ad-use-cache")]
    pub path: String,
    /// Number of requests per run
    #[arg(short = 'n', long, default_value_t = 10_000)]
    pub requests: usize,
    /// Requests launched together in one batch
    #[arg(short = 'c', long, default_value_t = 100)]
    pub parallelism: usize,
    /// Port whose listening process is sampled (default: port of the base URL)
    #[arg(long)]
    pub port: Option<u16>,
    /// Largest id drawn for the URLs
    #[arg(long, default_value_t = 10_000)]
    pub id_max: u32,
    /// Seed for the id generator (default: wall clock)
    #[arg(long)]
    pub seed: Option<u64>,
    /// Request timeout
    #[arg(short = 'T', long, default_value = "30s", value_parser = parse_duration)]
    pub timeout: Duration,
    /// Connection timeout
    #[arg(short = 'C', long, default_value = "20s", value_parser = parse_duration)]
    pub connection_timeout: Duration,
    /// Pause between batches
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub batch_delay: Duration,
    /// Pause between the cold and the warm run
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub settle: Duration,
    /// Warm memory growth above cold growth times this is reported as a suspected leak
    #[arg(long, default_value_t = 1.5)]
    pub leak_factor: f64,
    /// Warm memory growth below cold growth times this is reported as good caching
    #[arg(long, default_value_t = 0.5)]
    pub caching_factor: f64,
    /// Latency change (in percent) considered significant
    #[arg(long, default_value_t = 10.0)]
    pub latency_threshold: f64,
    /// Write the full comparison as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
    /// Summarize the per-run output
    #[arg(short = 's')]
    pub summarize: bool,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Base URL the started service will answer on
    #[arg(long, default_value = "http://localhost:3001")]
    pub base_url: String,
    /// Resource path placed between the base URL and the id
    #[arg(long, default_value = "ad")]
    pub path: String,
    /// Port whose listening process is sampled (default: port of the base URL)
    #[arg(long)]
    pub port: Option<u16>,
    /// Command line that starts the service (default: npx next start --port <port>)
    #[arg(long)]
    pub server_cmd: Option<String>,
    /// Number of distinct items to load
    #[arg(long, default_value_t = 10)]
    pub items: usize,
    /// Items are drawn from 1..=id-max
    #[arg(long, default_value_t = 100)]
    pub id_max: u32,
    /// Seed for the id generator (default: wall clock)
    #[arg(long)]
    pub seed: Option<u64>,
    /// Request timeout
    #[arg(short = 'T', long, default_value = "30s", value_parser = parse_duration)]
    pub timeout: Duration,
    /// Connection timeout
    #[arg(short = 'C', long, default_value = "20s", value_parser = parse_duration)]
    pub connection_timeout: Duration,
    /// Pause between items
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub item_delay: Duration,
    /// Pause between a response and the second resource sample
    #[arg(long, default_value = "500ms", value_parser = parse_duration)]
    pub post_request_settle: Duration,
    /// Time SIGTERM gets before the service is killed
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub grace: Duration,
    /// How long to wait for the service to accept connections
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub startup_timeout: Duration,
    /// Peak heap growth above baseline (MB) flagged as high
    #[arg(long, default_value_t = 50.0)]
    pub high_memory_mb: f64,
    /// Directory the JSON report is written to
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
}

/// Settings of a cold/warm comparison.
#[derive(Debug, Clone)]
pub struct CompareConfig {
    pub base_url: String,
    pub path: String,
    pub total_requests: usize,
    pub parallelism: usize, // requests per batch
    pub target_port: u16,
    pub id_max: u32,
    pub seed: u64,
    pub request_timeout: Duration, // total time for request/response cycle
    pub connection_timeout: Duration, // timeout for establishing the connection only
    pub inter_batch_delay: Duration,
    pub inter_run_settle: Duration,
    pub thresholds: Thresholds,
    pub report_path: Option<PathBuf>,
    pub summarize: bool,
}

impl Default for CompareConfig {
    fn default() -> Self {
        CompareConfig {
            base_url: "http://localhost:3000".to_string(),
            path: "ad-use-cache".to_string(),
            total_requests: 10_000,
            parallelism: 100,
            target_port: 3000,
            id_max: 10_000,
            seed: 0,
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(20),
            inter_batch_delay: Duration::from_millis(100),
            inter_run_settle: Duration::from_secs(5),
            thresholds: Thresholds::default(),
            report_path: None,
            summarize: false,
        }
    }
}

/// Settings of a sequential monitor run.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_url: String,
    pub path: String,
    pub target_port: u16,
    pub server_command: Vec<String>,
    pub unique_item_count: usize,
    pub id_max: u32,
    pub seed: u64,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub inter_item_delay: Duration,
    pub post_request_settle: Duration,
    pub grace: Duration,
    pub startup_timeout: Duration,
    pub high_memory_threshold_mb: f64,
    pub output_dir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            base_url: "http://localhost:3001".to_string(),
            path: "ad".to_string(),
            target_port: 3001,
            server_command: default_server_command(3001),
            unique_item_count: 10,
            id_max: 100,
            seed: 0,
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(20),
            inter_item_delay: Duration::from_secs(2),
            post_request_settle: Duration::from_millis(500),
            grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
            high_memory_threshold_mb: 50.0,
            output_dir: PathBuf::from("."),
        }
    }
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Config(ERR_INVALID_THREADS.to_string()));
        }
        Ok(())
    }
}

impl CompareArgs {
    pub fn into_config(self) -> Result<CompareConfig> {
        if self.requests == 0 {
            return Err(Error::Config(ERR_INVALID_REQUESTS.to_string()));
        }
        if self.parallelism == 0 {
            return Err(Error::Config(ERR_INVALID_PARALLELISM.to_string()));
        }
        if self.parallelism > self.requests {
            return Err(Error::Config(ERR_INVALID_REQUESTS_AND_PARALLELISM.to_string()));
        }
        let target_port = resolve_port(&self.base_url, self.port)?;

        Ok(CompareConfig {
            base_url: self.base_url,
            path: self.path,
            total_requests: self.requests,
            parallelism: self.parallelism,
            target_port,
            id_max: self.id_max,
            seed: self.seed.unwrap_or_else(clock_seed),
            request_timeout: self.timeout,
            connection_timeout: self.connection_timeout,
            inter_batch_delay: self.batch_delay,
            inter_run_settle: self.settle,
            thresholds: Thresholds {
                leak_factor: self.leak_factor,
                caching_factor: self.caching_factor,
                latency_pct: self.latency_threshold,
            },
            report_path: self.report,
            summarize: self.summarize,
        })
    }
}

impl MonitorArgs {
    pub fn into_config(self) -> Result<MonitorConfig> {
        if self.items == 0 || self.items > self.id_max as usize {
            return Err(Error::Config(format!(
                "{}: need 1..={} distinct ids",
                ERR_INVALID_ITEMS, self.id_max
            )));
        }
        let target_port = resolve_port(&self.base_url, self.port)?;
        let server_command = match &self.server_cmd {
            Some(cmd) => cmd.split_whitespace().map(str::to_string).collect(),
            None => default_server_command(target_port),
        };
        if server_command.is_empty() {
            return Err(Error::Config(ERR_EMPTY_SERVER_COMMAND.to_string()));
        }

        Ok(MonitorConfig {
            base_url: self.base_url,
            path: self.path,
            target_port,
            server_command,
            unique_item_count: self.items,
            id_max: self.id_max,
            seed: self.seed.unwrap_or_else(clock_seed),
            request_timeout: self.timeout,
            connection_timeout: self.connection_timeout,
            inter_item_delay: self.item_delay,
            post_request_settle: self.post_request_settle,
            grace: self.grace,
            startup_timeout: self.startup_timeout,
            high_memory_threshold_mb: self.high_memory_mb,
            output_dir: self.output_dir,
        })
    }
}

fn default_server_command(port: u16) -> Vec<String> {
    ["npx", "next", "start", "--port"]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(port.to_string()))
        .collect()
}

// Explicit port wins; otherwise the one the base URL points at
fn resolve_port(base_url: &str, port: Option<u16>) -> Result<u16> {
    Url::parse(base_url)?; // reject bad URLs even when the port is given
    match port {
        Some(port) => Ok(port),
        None => Ok(url_address(base_url)?.1),
    }
}

/// Parses durations like `500ms`, `10s`, `1m`, `1h`. A bare number is taken as seconds.
pub fn parse_duration(duration_str: &str) -> std::result::Result<Duration, String> {
    let duration_str = duration_str.trim();
    // nothing specified
    if duration_str.is_empty() {
        return Err("empty duration".to_string());
    }

    // split into value and unit for (ms, s, m, h)
    let (value_str, unit) = if let Some(value) = duration_str.strip_suffix("ms") {
        (value, "ms")
    } else if let Some(value) = duration_str.strip_suffix('s') {
        (value, "s")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, "m")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, "h")
    } else {
        (duration_str, "s") // if no unit is provided use seconds
    };

    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid duration '{}'", duration_str))?;

    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(60 * 60),
        _ => Some(value),
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", duration_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("loadwatch").chain(args.iter().copied())).unwrap()
    }

    fn compare(args: &[&str]) -> Result<CompareConfig> {
        let mut full = vec!["compare"];
        full.extend_from_slice(args);
        match parse(&full).command {
            Commands::Compare(args) => args.into_config(),
            _ => unreachable!(),
        }
    }

    fn monitor(args: &[&str]) -> Result<MonitorConfig> {
        let mut full = vec!["monitor"];
        full.extend_from_slice(args);
        match parse(&full).command {
            Commands::Monitor(args) => args.into_config(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        assert!(parse_duration("9999999999999999h").is_err());
        assert!(parse_duration("9999999999999999999m").is_err());
        assert!(Cli::try_parse_from(["loadwatch", "compare", "--settle", "9999999999999999h"]).is_err());
    }

    #[test]
    fn compare_defaults_match_config_defaults() {
        let config = compare(&["--seed", "9"]).unwrap();
        let defaults = CompareConfig::default();

        assert_eq!(config.base_url, defaults.base_url);
        assert_eq!(config.path, defaults.path);
        assert_eq!(config.total_requests, 10_000);
        assert_eq!(config.parallelism, 100);
        assert_eq!(config.target_port, 3000);
        assert_eq!(config.seed, 9);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.inter_batch_delay, Duration::from_millis(100));
        assert_eq!(config.inter_run_settle, Duration::from_secs(5));
        assert_eq!(config.thresholds, Thresholds::default());
    }

    #[test]
    fn parallelism_cannot_exceed_requests() {
        assert!(matches!(compare(&["-n", "10", "-c", "20"]), Err(Error::Config(_))));
        assert!(matches!(compare(&["-n", "0"]), Err(Error::Config(_))));
        assert!(matches!(compare(&["-c", "0"]), Err(Error::Config(_))));
        assert!(compare(&["-n", "20", "-c", "20"]).is_ok());
    }

    #[test]
    fn port_comes_from_url_unless_given() {
        assert_eq!(compare(&["--base-url", "http://127.0.0.1:8080"]).unwrap().target_port, 8080);
        assert_eq!(compare(&["--base-url", "http://example.com"]).unwrap().target_port, 80);
        assert_eq!(compare(&["--port", "4000"]).unwrap().target_port, 4000);
        assert!(matches!(compare(&["--base-url", "nope"]), Err(Error::Url(_))));
    }

    #[test]
    fn monitor_defaults() {
        let config = monitor(&[]).unwrap();
        assert_eq!(config.target_port, 3001);
        assert_eq!(config.unique_item_count, 10);
        assert_eq!(config.server_command, vec!["npx", "next", "start", "--port", "3001"]);
        assert_eq!(config.inter_item_delay, Duration::from_secs(2));
        assert_eq!(config.post_request_settle, Duration::from_millis(500));
        assert_eq!(config.grace, Duration::from_secs(5));
        assert_eq!(config.high_memory_threshold_mb, 50.0);
    }

    #[test]
    fn monitor_server_command_and_item_bounds() {
        let config = monitor(&["--server-cmd", "node server.js --port 4000"]).unwrap();
        assert_eq!(config.server_command, vec!["node", "server.js", "--port", "4000"]);

        assert!(matches!(monitor(&["--items", "101"]), Err(Error::Config(_))));
        assert!(matches!(monitor(&["--items", "0"]), Err(Error::Config(_))));
        assert!(matches!(monitor(&["--server-cmd", "  "]), Err(Error::Config(_))));
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(parse(&["-t", "0", "compare"]).validate().is_err());
        assert!(parse(&["compare", "--threads", "4"]).validate().is_ok());
    }
}
