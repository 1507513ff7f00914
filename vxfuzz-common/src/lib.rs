//! Shared plumbing for the vxfuzz harness.
//!
//! Everything that talks to the outside world lives here: the VM control
//! program, the target's TCP service, and the remote debug agent. The
//! `vxfuzz` binary composes these into the per-test lifecycle.

pub mod config;
pub mod debug;
pub mod errors;
pub mod liveness;
pub mod logging;
pub mod mock;
pub mod report;
pub mod transport;
pub mod types;
pub mod vm;

pub use config::{ConfigError, EnvParser, HarnessConfig};
pub use debug::{AgentChannel, AgentSession, DebugChannel, DebugSession};
pub use errors::{DebugError, HarnessError, Result, TransportError};
pub use liveness::{LivenessProbe, TcpProbe, is_alive};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use report::{JsonlReportSink, MemoryReportSink, ReportSink};
pub use transport::TransportSession;
pub use types::{
    ConnectionId, CrashReport, EnvironmentState, TargetEndpoint, TestCase, VmHandle,
};
pub use vm::{ControlProgram, EnvironmentController, VmCommand, Vmrun};
