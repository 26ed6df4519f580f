use std::time::{Duration, Instant};

use isahc::{
    config::Configurable,
    error::ErrorKind,
    AsyncReadResponseExt,
    HttpClient,
    HttpClientBuilder,
};
use serde::Serialize;
use tokio::net::TcpStream;
use url::Url;

use crate::prelude::*;
use crate::report::round2;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Settled result of a single GET.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    Success {
        url: String,
        status: u16,
        latency_ms: f64,
        bytes: usize, // response body length
    },
    Failure {
        url: String,
        status: Option<u16>, // set when the server answered with a non 2.x.x status
        latency_ms: f64,
        reason: String,
        timed_out: bool,
    },
}

impl RequestOutcome {
    pub fn url(&self) -> &str {
        match self {
            RequestOutcome::Success { url, .. } | RequestOutcome::Failure { url, .. } => url,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }

    pub fn latency_ms(&self) -> f64 {
        match self {
            RequestOutcome::Success { latency_ms, .. } | RequestOutcome::Failure { latency_ms, .. } => {
                *latency_ms
            }
        }
    }

    /// Latency of a successful request, `None` for failures.
    pub fn success_latency_ms(&self) -> Option<f64> {
        match self {
            RequestOutcome::Success { latency_ms, .. } => Some(*latency_ms),
            RequestOutcome::Failure { .. } => None,
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            RequestOutcome::Success { bytes, .. } => *bytes,
            RequestOutcome::Failure { .. } => 0,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, RequestOutcome::Failure { timed_out: true, .. })
    }
}

/// Issues timed GET requests. Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    client: HttpClient,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(timeout: Duration, connection_timeout: Duration) -> Result<Self> {
        let client = HttpClientBuilder::new()
            .timeout(timeout) // total time for the request/response cycle
            .connect_timeout(connection_timeout)
            .default_header("user-agent", USER_AGENT)
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Send one GET and settle it. Transport errors, timeouts and non 2.x.x statuses all
    /// come back as [`RequestOutcome::Failure`].
    pub async fn execute(&self, url: &str) -> RequestOutcome {
        let start = Instant::now();
        let response = self.client.get_async(url).await;

        match response {
            Ok(mut res) => {
                let status = res.status().as_u16();
                let body = res.bytes().await;
                let latency_ms = elapsed_ms(start);
                match body {
                    Ok(body) if res.status().is_success() => RequestOutcome::Success {
                        url: url.to_string(),
                        status,
                        latency_ms,
                        bytes: body.len(),
                    },
                    Ok(_) => RequestOutcome::Failure {
                        url: url.to_string(),
                        status: Some(status),
                        latency_ms,
                        reason: format!("HTTP {}", status),
                        timed_out: false,
                    },
                    Err(err) => RequestOutcome::Failure {
                        url: url.to_string(),
                        status: Some(status),
                        latency_ms,
                        reason: format!("failed to read body: {}", err),
                        timed_out: false,
                    },
                }
            }
            Err(err) => {
                let timed_out = matches!(err.kind(), ErrorKind::Timeout);
                let reason = if timed_out {
                    format!("timed out after {:?}", self.timeout)
                } else {
                    err.to_string()
                };
                RequestOutcome::Failure {
                    url: url.to_string(),
                    status: None,
                    latency_ms: elapsed_ms(start),
                    reason,
                    timed_out,
                }
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    round2(start.elapsed().as_secs_f64() * 1000.0)
}

/// Host and port a URL points at, with the scheme's default port filled in.
pub fn url_address(url: &str) -> Result<(String, u16)> {
    let parsed_url = Url::parse(url)?;
    let hostname = parsed_url
        .host_str()
        .ok_or_else(|| Error::Config(format!("{} does not have a valid hostname", url)))?;
    let port = parsed_url.port_or_known_default().unwrap_or(80); // HTTP port 80 if none specified
    Ok((hostname.to_string(), port))
}

/// Poll until a TCP connection to the URL's host succeeds or `timeout` passes.
pub async fn wait_until_reachable(url: &str, timeout: Duration) -> Result<()> {
    let (hostname, port) = url_address(url)?;
    let address = format!("{}:{}", hostname, port);
    let start = Instant::now();
    loop {
        match TcpStream::connect(&address).await {
            Ok(_) => return Ok(()),
            Err(e) => trace!("{} not reachable yet: {}", address, e),
        }
        if start.elapsed() >= timeout {
            return Err(Error::Unreachable(address, timeout));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
