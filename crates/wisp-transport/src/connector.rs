//! Outbound connection to a single stream-host candidate.

use crate::bytestream::{SharedBytestream, Socks5Bytestream};
use crate::candidate::{DstAddr, StreamHostCandidate};
use crate::error::{TransportError, TransportResult};
use crate::socks5;
use crate::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_READ_BUFFER_SIZE};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// SOCKS5 client configuration
#[derive(Debug, Clone)]
pub struct Socks5Config {
    /// Timeout for the TCP connect to one candidate
    pub connect_timeout: Duration,
    /// Timeout for the SOCKS5 handshake once connected
    pub handshake_timeout: Duration,
    /// Read buffer size per `receive()` call
    pub read_buffer_size: usize,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// One connection attempt to a stream host.
///
/// Candidate trial drives a `Connector` once per candidate, so tests can
/// substitute scripted outcomes for real sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `candidate` and complete the handshake for `dst`.
    ///
    /// # Errors
    /// Returns `TransportError` if the candidate cannot be used
    async fn connect(
        &self,
        candidate: &StreamHostCandidate,
        dst: &DstAddr,
    ) -> TransportResult<SharedBytestream>;
}

/// Connector that dials candidates over TCP and speaks SOCKS5.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: Socks5Config,
}

impl TcpConnector {
    /// Create a connector with the given configuration
    #[must_use]
    pub fn new(config: Socks5Config) -> Self {
        Self { config }
    }

    /// Connector configuration
    #[must_use]
    pub fn config(&self) -> &Socks5Config {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        candidate: &StreamHostCandidate,
        dst: &DstAddr,
    ) -> TransportResult<SharedBytestream> {
        let endpoint = candidate.endpoint();

        let mut stream = match timeout(self.config.connect_timeout, TcpStream::connect(&endpoint))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!("{endpoint}: {e}")));
            }
            Err(_) => {
                return Err(TransportError::Timeout(format!("connect to {endpoint}")));
            }
        };
        stream.set_nodelay(true)?;

        match timeout(
            self.config.handshake_timeout,
            socks5::client_handshake(&mut stream, dst),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "SOCKS5 handshake with {endpoint}"
                )));
            }
        }

        tracing::debug!(
            host = %candidate.host_identity,
            endpoint = %endpoint,
            dst = %dst.short(),
            "SOCKS5 bytestream established"
        );

        Ok(Arc::new(Socks5Bytestream::new(
            stream,
            Some(candidate.clone()),
            self.config.read_buffer_size,
        )))
    }
}
