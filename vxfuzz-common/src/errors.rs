//! Error taxonomy for the test lifecycle.
//!
//! | Kind                      | Fatal | Handling                                  |
//! |---------------------------|-------|-------------------------------------------|
//! | `ToolingFailure`          | yes   | surfaces to the operator, never retried   |
//! | `EnvironmentUnhealthy`    | no    | one restart-and-rearm cycle               |
//! | `SetupFailure`            | yes   | recovery could not restore health         |
//! | `UnexpectedTeardownState` | yes   | someone else stopped the VM               |
//! | `Transport`               | no    | per-test failure, session continues       |
//! | `DebugChannel`            | yes   | crash coverage can no longer be armed     |
//! | `Config`                  | yes   | rejected before the session starts        |
//! | `Cancelled`               | yes   | operator interrupt or session deadline    |

use crate::config::ConfigError;
use crate::types::TargetEndpoint;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the lifecycle components.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("control program failed running `{command}`: {reason}")]
    ToolingFailure { command: String, reason: String },

    #[error("environment unhealthy: {0}")]
    EnvironmentUnhealthy(String),

    #[error("setup failed: {0}")]
    SetupFailure(String),

    #[error("VM is already stopped or paused")]
    UnexpectedTeardownState,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("debug channel failure: {0}")]
    DebugChannel(#[from] DebugError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session cancelled")]
    Cancelled,
}

impl HarnessError {
    /// Whether this error terminates the fuzzing session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EnvironmentUnhealthy(_) | Self::Transport(_))
    }

    /// Process exit code for a session that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ToolingFailure { .. } => 2,
            Self::SetupFailure(_) => 3,
            Self::UnexpectedTeardownState => 4,
            Self::DebugChannel(_) => 5,
            Self::Config(_) => 6,
            Self::Cancelled => 130,
            Self::EnvironmentUnhealthy(_) | Self::Transport(_) => 1,
        }
    }
}

/// Errors on the per-test TCP connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport session is not open")]
    NotOpen,

    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: TargetEndpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a debug-channel session.
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("failed to connect debug channel: {0}")]
    Connect(String),

    #[error("debug channel protocol error: {0}")]
    Protocol(String),

    #[error("debug connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds_are_not_fatal() {
        assert!(!HarnessError::EnvironmentUnhealthy("down".into()).is_fatal());
        assert!(!HarnessError::Transport(TransportError::NotOpen).is_fatal());
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(
            HarnessError::ToolingFailure {
                command: "list".into(),
                reason: "exit status 255".into()
            }
            .is_fatal()
        );
        assert!(HarnessError::SetupFailure("Cannot start the VM".into()).is_fatal());
        assert!(HarnessError::UnexpectedTeardownState.is_fatal());
        assert!(HarnessError::DebugChannel(DebugError::Closed).is_fatal());
        assert!(HarnessError::Cancelled.is_fatal());
    }

    #[test]
    fn test_exit_codes_are_distinct_for_fatal_kinds() {
        let codes = [
            HarnessError::ToolingFailure {
                command: "start".into(),
                reason: String::new(),
            }
            .exit_code(),
            HarnessError::SetupFailure(String::new()).exit_code(),
            HarnessError::UnexpectedTeardownState.exit_code(),
            HarnessError::DebugChannel(DebugError::Closed).exit_code(),
            HarnessError::Cancelled.exit_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_teardown_message() {
        assert_eq!(
            HarnessError::UnexpectedTeardownState.to_string(),
            "VM is already stopped or paused"
        );
    }

    #[test]
    fn test_transport_connect_display_names_endpoint() {
        let err = TransportError::Connect {
            endpoint: TargetEndpoint::new("10.0.0.5", 111),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("10.0.0.5:111"));
    }
}
