//! Per-test TCP connection to the target service.
//!
//! One connection per test execution: the target is a single embedded
//! service that may be crashed by the test, so nothing is pooled and
//! nothing reconnects behind the caller's back.

use crate::errors::TransportError;
use crate::types::TargetEndpoint;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Default socket timeout for test traffic.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default upper bound for a single receive.
pub const DEFAULT_RECEIVE_LIMIT: usize = 10_000;

/// Either fully closed (no stream) or fully open (exactly one stream).
#[derive(Debug)]
pub struct TransportSession {
    endpoint: TargetEndpoint,
    timeout: Option<Duration>,
    stream: Option<TcpStream>,
}

impl TransportSession {
    /// Create a closed session. `timeout` bounds connect, send and receive.
    pub fn new(endpoint: TargetEndpoint, timeout: Option<Duration>) -> Self {
        Self {
            endpoint,
            timeout,
            stream: None,
        }
    }

    pub fn endpoint(&self) -> &TargetEndpoint {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the target. No-op when already open.
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            trace!("Transport to {} already open", self.endpoint);
            return Ok(());
        }

        let connect = TcpStream::connect(self.endpoint.authority());
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "connect",
                    timeout,
                })?,
            None => connect.await,
        };

        let stream = result.map_err(|source| TransportError::Connect {
            endpoint: self.endpoint.clone(),
            source,
        })?;
        debug!("Transport connected to {}", self.endpoint);
        self.stream = Some(stream);
        Ok(())
    }

    /// Send the whole payload.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, stream.write_all(payload))
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "send",
                    timeout,
                })??,
            None => stream.write_all(payload).await?,
        }
        trace!("Sent {} bytes to {}", payload.len(), self.endpoint);
        Ok(())
    }

    /// Read at most `max_bytes`. An empty result means the peer closed.
    pub async fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let mut buf = vec![0u8; max_bytes];
        let read = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, stream.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "receive",
                    timeout,
                })??,
            None => stream.read(&mut buf).await?,
        };
        buf.truncate(read);
        trace!("Received {} bytes from {}", read, self.endpoint);
        Ok(buf)
    }

    /// Release the connection. Always leaves the session closed.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone after a crash; the handle is released either way.
            let _ = stream.shutdown().await;
            debug!("Transport to {} closed", self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> (TcpListener, TargetEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, TargetEndpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_open_send_receive_close() {
        let (listener, endpoint) = echo_server().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut session = TransportSession::new(endpoint, Some(Duration::from_secs(2)));
        assert!(!session.is_open());
        session.open().await.unwrap();
        assert!(session.is_open());
        session.send(b"ping").await.unwrap();
        let reply = session.receive(DEFAULT_RECEIVE_LIMIT).await.unwrap();
        assert_eq!(reply, b"ping");
        session.close().await;
        assert!(!session.is_open());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (listener, endpoint) = echo_server().await;
        let accepts = tokio::spawn(async move {
            let _first = listener.accept().await.unwrap();
            // A second connection must not arrive.
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        });

        let mut session = TransportSession::new(endpoint, None);
        session.open().await.unwrap();
        session.open().await.unwrap();
        assert!(session.is_open());
        assert!(accepts.await.unwrap(), "second open created a new connection");
        session.close().await;
    }

    #[tokio::test]
    async fn test_send_on_closed_session_is_rejected() {
        let mut session = TransportSession::new(TargetEndpoint::new("127.0.0.1", 9), None);
        let err = session.send(b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
        let err = session.receive(16).await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_session_closed() {
        let (listener, endpoint) = echo_server().await;
        drop(listener);

        let mut session = TransportSession::new(endpoint, Some(Duration::from_millis(500)));
        let err = session.open().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        ));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_close_after_peer_reset_still_releases() {
        let (listener, endpoint) = echo_server().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let mut session = TransportSession::new(endpoint, Some(Duration::from_secs(1)));
        session.open().await.unwrap();
        server.await.unwrap();
        let reply = session.receive(64).await.unwrap_or_default();
        assert!(reply.is_empty());
        session.close().await;
        assert!(!session.is_open());
        session.close().await;
        assert!(!session.is_open());
    }
}
