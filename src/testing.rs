//! Test doubles: a tiny HTTP server and a scripted process inspector.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::inspector::ProcessInspector;
use crate::prelude::*;
use crate::sampler::{CpuReading, MemoryUsage, ResourceSnapshot};

/// HTTP/1.1 server on an ephemeral port.
///
/// `/fail/*` answers 500, `/slow/*` waits two seconds before answering, everything else
/// answers 200 with [`MockServer::BODY`].
pub struct MockServer {
    port: u16,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub const BODY: &'static str = "<html>ad</html>";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(Self::serve(stream));
            }
        });
        Self { port, hits, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// A port nothing is listening on.
    pub async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn serve(mut stream: TcpStream) {
        let mut buf = vec![0u8; 4096];
        let mut read = 0;
        while read < buf.len() {
            match stream.read(&mut buf[read..]).await {
                Ok(0) | Err(_) => return,
                Ok(n) => read += n,
            }
            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let request = String::from_utf8_lossy(&buf[..read]);
        let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

        let (status, body) = if path.starts_with("/fail") {
            ("500 Internal Server Error", "boom")
        } else {
            if path.starts_with("/slow") {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            ("200 OK", Self::BODY)
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Inspector that answers from a script instead of the OS.
///
/// Memory readings are popped in order; once the script runs dry the last reading repeats.
#[derive(Debug, Default)]
pub struct ScriptedInspector {
    pub pid: Option<u32>,
    pub process_cpu: Option<f64>,
    pub system_cpu: Vec<f64>,
    memory: Mutex<VecDeque<MemoryUsage>>,
    last: Mutex<Option<MemoryUsage>>,
    pub memory_calls: AtomicUsize,
}

impl ScriptedInspector {
    pub fn listening(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            process_cpu: Some(12.5),
            system_cpu: vec![10.0, 20.0],
            ..Self::default()
        }
    }

    pub fn without_listener() -> Self {
        Self {
            system_cpu: vec![10.0, 20.0, 30.0, 40.0],
            ..Self::default()
        }
    }

    pub fn with_rss(self, rss_series: &[f64]) -> Self {
        let readings = rss_series
            .iter()
            .map(|&rss| MemoryUsage {
                rss_mb: rss,
                heap_total_mb: rss * 2.0,
                heap_used_mb: None,
                external_mb: None,
            })
            .collect();
        self.with_memory(readings)
    }

    pub fn with_memory(self, readings: Vec<MemoryUsage>) -> Self {
        *self.memory.lock().unwrap() = readings.into();
        self
    }
}

#[async_trait]
impl ProcessInspector for ScriptedInspector {
    async fn resolve_listener(&self, port: u16) -> Result<u32> {
        self.pid.ok_or(Error::NoListenerFound(port))
    }

    async fn memory(&self, _pid: u32) -> Result<MemoryUsage> {
        self.memory_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.memory.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(reading) = next {
            *last = Some(reading);
        }
        last.clone()
            .ok_or_else(|| Error::Parse("no scripted memory reading".to_string()))
    }

    async fn process_cpu(&self, _pid: u32) -> Result<Option<f64>> {
        Ok(self.process_cpu)
    }

    async fn system_cpu(&self) -> Vec<f64> {
        self.system_cpu.clone()
    }
}

/// Snapshot with the given heap_total (RSS a quarter of it), or without memory.
pub fn snapshot(heap_total_mb: Option<f64>) -> ResourceSnapshot {
    ResourceSnapshot {
        pid: heap_total_mb.map(|_| 1),
        memory: heap_total_mb.map(|heap_total_mb| MemoryUsage {
            rss_mb: heap_total_mb / 4.0,
            heap_total_mb,
            heap_used_mb: None,
            external_mb: None,
        }),
        cpu: CpuReading::Process(1.0),
        captured_at: chrono::Utc::now(),
    }
}
