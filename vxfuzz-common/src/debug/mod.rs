//! Remote debug / crash-notification channel.
//!
//! The remote notification mechanism delivers at most one event per
//! connection. A session that has already reported a fault will not report
//! the next one, so callers cycle the connection once per test.

pub mod agent;

use crate::errors::DebugError;
use crate::types::ConnectionId;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

pub use agent::{AgentChannel, AgentSession};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id.
pub fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst))
}

/// Factory for debug sessions against one target.
pub trait DebugChannel: Send + Sync + 'static {
    type Session: DebugSession;

    /// Establish a new connection to the remote debug service.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, DebugError>> + Send;
}

/// One live connection to the debug service.
pub trait DebugSession: Send + 'static {
    /// Identity of the underlying connection.
    fn id(&self) -> ConnectionId;

    /// Subscribe to fault notifications on this connection.
    fn begin_monitoring(&mut self) -> impl Future<Output = Result<(), DebugError>> + Send;

    /// Block until the target reports a fault and return its opaque context.
    ///
    /// Returns [`DebugError::Closed`] when the connection goes away first.
    fn monitor(&mut self) -> impl Future<Output = Result<serde_json::Value, DebugError>> + Send;

    /// Tear the connection down.
    fn disconnect(self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique_and_increasing() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }
}
