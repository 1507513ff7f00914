//! Debug channel backed by an external agent process.
//!
//! The agent owns the remote-debug wire protocol. It is spawned once per
//! connection with `--target <addr> --version <n>` and speaks JSON lines:
//!
//! - agent -> harness: `{"event":"ready"}` once connected
//! - harness -> agent: `monitor` to subscribe to fault notifications
//! - agent -> harness: `{"event":"crash","context":{...}}` on a fault
//! - agent -> harness: `{"event":"log","message":"..."}` at any time
//!
//! Killing the process is the disconnect.

use super::{DebugChannel, DebugSession, next_connection_id};
use crate::errors::DebugError;
use crate::types::ConnectionId;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// How long a freshly spawned agent may take to report `ready`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum AgentEvent {
    Ready,
    Crash {
        #[serde(default)]
        context: serde_json::Value,
    },
    Log {
        message: String,
    },
}

/// Spawns one agent process per debug connection.
#[derive(Debug, Clone)]
pub struct AgentChannel {
    program: PathBuf,
    args: Vec<String>,
    target: String,
    target_version: u8,
    connect_timeout: Duration,
}

impl AgentChannel {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        target: impl Into<String>,
        target_version: u8,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            target: target.into(),
            target_version,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl DebugChannel for AgentChannel {
    type Session = AgentSession;

    async fn connect(&self) -> Result<AgentSession, DebugError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--target")
            .arg(&self.target)
            .arg("--version")
            .arg(self.target_version.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DebugError::Connect(format!("cannot spawn {}: {}", self.program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DebugError::Connect("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DebugError::Connect("agent stdout unavailable".to_string()))?;

        let mut session = AgentSession {
            id: next_connection_id(),
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        };

        match tokio::time::timeout(self.connect_timeout, session.wait_ready()).await {
            Ok(Ok(())) => {
                debug!("Debug agent connected to {} ({})", self.target, session.id);
                Ok(session)
            }
            Ok(Err(e)) => {
                session.disconnect().await;
                Err(DebugError::Connect(e.to_string()))
            }
            Err(_) => {
                session.disconnect().await;
                Err(DebugError::Connect(format!(
                    "agent not ready after {:?}",
                    self.connect_timeout
                )))
            }
        }
    }
}

/// A running agent process.
#[derive(Debug)]
pub struct AgentSession {
    id: ConnectionId,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl AgentSession {
    async fn next_event(&mut self) -> Result<AgentEvent, DebugError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(DebugError::Closed);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map_err(|e| DebugError::Protocol(format!("bad agent line {line:?}: {e}")));
        }
    }

    async fn wait_ready(&mut self) -> Result<(), DebugError> {
        loop {
            match self.next_event().await? {
                AgentEvent::Ready => return Ok(()),
                AgentEvent::Log { message } => debug!("agent {}: {}", self.id, message),
                AgentEvent::Crash { .. } => {
                    return Err(DebugError::Protocol(
                        "crash reported before monitoring began".to_string(),
                    ));
                }
            }
        }
    }
}

impl DebugSession for AgentSession {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn begin_monitoring(&mut self) -> Result<(), DebugError> {
        self.stdin.write_all(b"monitor\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn monitor(&mut self) -> Result<serde_json::Value, DebugError> {
        loop {
            match self.next_event().await? {
                AgentEvent::Crash { context } => return Ok(context),
                AgentEvent::Log { message } => debug!("agent {}: {}", self.id, message),
                AgentEvent::Ready => warn!("agent {} sent a second ready", self.id),
            }
        }
    }

    async fn disconnect(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("agent {} already gone: {}", self.id, e);
        }
    }
}
