use std::io;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No process is listening on port {0}")]
    NoListenerFound(u16),
    #[error("Command execution error: '{cmd}' exited with status {status}")]
    ExecError { cmd: String, status: ExitStatus },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("HTTP client error: {0}")]
    Http(#[from] isahc::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(unix)]
    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),
    #[error("Cannot {action} server while it is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
    #[error("{0} did not become reachable within {1:?}")]
    Unreachable(String, std::time::Duration),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Interrupted by operator")]
    Interrupted,
}
