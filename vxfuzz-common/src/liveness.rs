//! TCP reachability checks against the target service.

use crate::types::TargetEndpoint;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default connect timeout for a liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Answers "is the target service accepting connections right now?".
pub trait LivenessProbe: Send + Sync {
    /// Never fails: any connect error or timeout means "not alive".
    fn is_alive(
        &self,
        endpoint: &TargetEndpoint,
        timeout: Duration,
    ) -> impl Future<Output = bool> + Send;
}

/// Probe that opens and immediately drops a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl LivenessProbe for TcpProbe {
    async fn is_alive(&self, endpoint: &TargetEndpoint, timeout: Duration) -> bool {
        is_alive(endpoint, timeout).await
    }
}

/// Attempt one TCP connect to `endpoint` within `timeout`.
pub async fn is_alive(endpoint: &TargetEndpoint, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint.authority())).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            debug!("Liveness probe to {} failed: {}", endpoint, e);
            false
        }
        Err(_) => {
            debug!("Liveness probe to {} timed out after {:?}", endpoint, timeout);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_listening_port_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = TargetEndpoint::new("127.0.0.1", port);

        assert!(TcpProbe.is_alive(&endpoint, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_not_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = TargetEndpoint::new("127.0.0.1", port);

        assert!(!is_alive(&endpoint, DEFAULT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_not_alive() {
        let endpoint = TargetEndpoint::new("host.invalid", 111);
        assert!(!is_alive(&endpoint, DEFAULT_PROBE_TIMEOUT).await);
    }
}
