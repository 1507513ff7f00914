//! Common types used across vxfuzz components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Network service under test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl TargetEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form accepted by `tokio::net::TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identifies the VM driven by the control program.
///
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    control_program: PathBuf,
    image: PathBuf,
    snapshot: String,
}

impl VmHandle {
    pub fn new(
        control_program: impl Into<PathBuf>,
        image: impl Into<PathBuf>,
        snapshot: impl Into<String>,
    ) -> Self {
        Self {
            control_program: control_program.into(),
            image: image.into(),
            snapshot: snapshot.into(),
        }
    }

    /// Path to the virtualization control binary (e.g. `vmrun`).
    pub fn control_program(&self) -> &Path {
        &self.control_program
    }

    /// Path to the VM image (`.vmx`).
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Image path as it appears in the control program's listing.
    pub fn image_str(&self) -> String {
        self.image.to_string_lossy().to_string()
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// File name of the VM image, used in log messages.
    pub fn image_name(&self) -> String {
        self.image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.image_str())
    }
}

/// Power state of the VM, always re-derived from the control program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Running,
    Stopped,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Identifier of one debug-channel connection.
///
/// A fresh id is allocated on every connect, so two sessions never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dbg#{}", self.0)
    }
}

/// A fault observed on the debug channel, attributed to a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Test that was in flight when the notification arrived.
    pub test_number: u64,
    /// Debug connection the notification was delivered on.
    pub connection: ConnectionId,
    /// When the harness picked the report up.
    pub detected_at: DateTime<Utc>,
    /// Opaque stack/register/context snapshot from the debug agent.
    pub context: serde_json::Value,
}

impl CrashReport {
    pub fn new(test_number: u64, connection: ConnectionId, context: serde_json::Value) -> Self {
        Self {
            test_number,
            connection,
            detected_at: Utc::now(),
            context,
        }
    }
}

/// One generated test case handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub number: u64,
    pub payload: Vec<u8>,
}
