//! OS process inspection.
//!
//! [`ProcessInspector`] is the seam between the harness and the operating system: which pid
//! listens on a port, and how much memory and CPU that pid uses. [`OsInspector`] answers by
//! shelling out to `lsof` and `ps`, and falls back to `sysinfo` for the system-wide CPU figure.

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;

use crate::prelude::*;
use crate::report::round2;
use crate::sampler::MemoryUsage;

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Pid of the process holding a listening TCP socket on `port`.
    async fn resolve_listener(&self, port: u16) -> Result<u32>;

    /// Resident and virtual memory of `pid`.
    async fn memory(&self, pid: u32) -> Result<MemoryUsage>;

    /// CPU percentage of `pid`, `Ok(None)` when the OS returned no row for it.
    async fn process_cpu(&self, pid: u32) -> Result<Option<f64>>;

    /// Busy percentage of every logical core.
    async fn system_cpu(&self) -> Vec<f64>;
}

#[derive(Debug, Default, Clone)]
pub struct OsInspector;

#[async_trait]
impl ProcessInspector for OsInspector {
    async fn resolve_listener(&self, port: u16) -> Result<u32> {
        let output = exec(
            Command::new("lsof")
                .arg("-t")
                .arg(format!("-iTCP:{}", port))
                .arg("-sTCP:LISTEN"),
        )
        .await;

        match output {
            Ok(stdout) => parse_listener_pid(&stdout).ok_or(Error::NoListenerFound(port)),
            // lsof exits non-zero when nothing matches
            Err(Error::ExecError { .. }) => Err(Error::NoListenerFound(port)),
            Err(e) => Err(e),
        }
    }

    async fn memory(&self, pid: u32) -> Result<MemoryUsage> {
        let stdout = exec(
            Command::new("ps")
                .arg("-p")
                .arg(pid.to_string())
                .arg("-o")
                .arg("rss,vsz"),
        )
        .await?;
        parse_memory(&stdout)
    }

    async fn process_cpu(&self, pid: u32) -> Result<Option<f64>> {
        let output = exec(
            Command::new("ps")
                .arg("-p")
                .arg(pid.to_string())
                .arg("-o")
                .arg("%cpu"),
        )
        .await;

        match output {
            Ok(stdout) => Ok(parse_cpu(&stdout)),
            // ps exits non-zero when the pid is gone; that is "no row", not a fault
            Err(Error::ExecError { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn system_cpu(&self) -> Vec<f64> {
        let mut system = System::new();
        system.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();

        system
            .cpus()
            .iter()
            .map(|cpu| round2(cpu.cpu_usage() as f64))
            .collect()
    }
}

/// `lsof -t` prints one pid per line; the last one is taken.
pub fn parse_listener_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .and_then(|line| line.parse().ok())
}

/// Parse `ps -o rss,vsz` output (header line, then values in KB) into megabytes.
pub fn parse_memory(stdout: &str) -> Result<MemoryUsage> {
    let row = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| Error::Parse(format!("ps returned no memory row: {:?}", stdout)))?;

    let values = row
        .split_whitespace()
        .map(|v| v.parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Parse(format!("bad ps memory row {:?}: {}", row, e)))?;

    match values.as_slice() {
        [rss_kb, vsz_kb] => Ok(MemoryUsage {
            rss_mb: kb_to_mb(*rss_kb),
            heap_total_mb: kb_to_mb(*vsz_kb),
            heap_used_mb: None, // not exposed by ps
            external_mb: None,
        }),
        _ => Err(Error::Parse(format!("expected rss and vsz, got {:?}", row))),
    }
}

/// Parse `ps -o %cpu` output. `None` when there is no data row.
pub fn parse_cpu(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .nth(1)
        .and_then(|row| row.trim().parse::<f64>().ok())
}

fn kb_to_mb(kb: f64) -> f64 {
    round2(kb / 1024.0)
}
