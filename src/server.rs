//! Lifecycle of the service process the monitor measures.
//!
//! ```text
//! NotStarted --start()--> Running --stop()--> Terminating --exit--> Terminated
//!                                                  |
//!                                     grace window elapsed: SIGKILL
//! ```

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    NotStarted,
    Running,
    Terminating,
    Terminated,
}

impl ServerState {
    fn as_str(&self) -> &'static str {
        match self {
            ServerState::NotStarted => "not started",
            ServerState::Running => "running",
            ServerState::Terminating => "terminating",
            ServerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process left the `Terminating` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    Forced,
    AlreadyExited,
}

#[derive(Debug)]
pub struct ServerProcess {
    program: String,
    args: Vec<String>,
    grace: Duration, // how long SIGTERM gets before SIGKILL
    child: Option<Child>,
    state: ServerState,
}

impl ServerProcess {
    pub fn new(command_line: &[String], grace: Duration) -> Result<Self> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| Error::Config("server command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            grace,
            child: None,
            state: ServerState::NotStarted,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Spawn the process. Its output is forwarded to the log at debug level.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ServerState::NotStarted {
            return Err(Error::InvalidTransition {
                action: "start",
                state: self.state.as_str(),
            });
        }

        info!("Starting server: {} {}", self.program, self.args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true) // best-effort cleanup if the monitor dies first
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        self.child = Some(child);
        self.state = ServerState::Running;
        Ok(())
    }

    /// Ask the process to exit, escalating to a kill once the grace window has passed.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        if self.state != ServerState::Running {
            return Err(Error::InvalidTransition {
                action: "stop",
                state: self.state.as_str(),
            });
        }
        let Some(child) = self.child.as_mut() else {
            self.state = ServerState::Terminated;
            return Ok(StopOutcome::AlreadyExited);
        };

        if let Ok(Some(status)) = child.try_wait() {
            info!("Server had already exited with {}", status);
            self.state = ServerState::Terminated;
            return Ok(StopOutcome::AlreadyExited);
        }

        info!("Stopping server...");
        self.state = ServerState::Terminating;
        if let Some(pid) = child.id() {
            if let Err(e) = terminate_gracefully(pid) {
                warn!("Graceful termination of pid {} failed: {}", pid, e);
            }
        }

        let outcome = match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => {
                debug!("Server exited with {:?}", status);
                StopOutcome::Graceful
            }
            Err(_) => {
                warn!("Server still running after {:?}, killing it", self.grace);
                child.kill().await?; // SIGKILL, then reap
                StopOutcome::Forced
            }
        };

        self.state = ServerState::Terminated;
        Ok(outcome)
    }
}

#[cfg(unix)]
fn terminate_gracefully(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
    Ok(())
}

// No SIGTERM equivalent for an arbitrary console process; the grace window simply runs out.
#[cfg(not(unix))]
fn terminate_gracefully(_pid: u32) -> Result<()> {
    Ok(())
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "server", "[{}] {}", name, line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn command(line: &[&str]) -> Vec<String> {
        line.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(ServerProcess::new(&[], Duration::ZERO), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn cooperative_process_stops_gracefully() {
        let mut server =
            ServerProcess::new(&command(&["sleep", "30"]), Duration::from_secs(5)).unwrap();
        assert_eq!(server.state(), ServerState::NotStarted);

        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.pid().is_some());

        let outcome = server.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(server.state(), ServerState::Terminated);
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_kill_after_grace() {
        let grace = Duration::from_millis(300);
        let mut server = ServerProcess::new(
            &command(&["sh", "-c", "trap '' TERM; sleep 30"]),
            grace,
        )
        .unwrap();
        server.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await; // let the trap install

        let start = Instant::now();
        let outcome = server.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(server.state(), ServerState::Terminated);
        assert!(start.elapsed() >= grace);
    }

    #[tokio::test]
    async fn exited_process_needs_no_signal() {
        let mut server = ServerProcess::new(&command(&["true"]), Duration::from_secs(5)).unwrap();
        server.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(server.stop().await.unwrap(), StopOutcome::AlreadyExited);
        assert_eq!(server.state(), ServerState::Terminated);
    }

    #[tokio::test]
    async fn transitions_are_enforced() {
        let mut server =
            ServerProcess::new(&command(&["sleep", "30"]), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            server.stop().await,
            Err(Error::InvalidTransition { action: "stop", .. })
        ));

        server.start().unwrap();
        assert!(matches!(server.start(), Err(Error::InvalidTransition { action: "start", .. })));

        server.stop().await.unwrap();
        assert!(matches!(server.start(), Err(Error::InvalidTransition { .. })));
        assert!(matches!(server.stop().await, Err(Error::InvalidTransition { .. })));
    }
}
