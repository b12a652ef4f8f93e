//! Local relay: the initiator's own SOCKS5 stream host.
//!
//! The relay binds before negotiation starts and accepts the target's
//! connection. Each accepted connection runs the server side of the SOCKS5
//! handshake and is matched by its destination address against the sessions
//! registered with [`RelayRegistry::expect`]. Matches are handed to the
//! acceptor callback as ready bytestreams; anything else is refused.

use crate::bytestream::Socks5Bytestream;
use crate::candidate::DstAddr;
use crate::error::{TransportError, TransportResult};
use crate::socks5::{self, REPLY_HOST_UNREACHABLE, REPLY_SUCCESS};
use crate::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_READ_BUFFER_SIZE};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Local relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Timeout for an inbound SOCKS5 handshake
    pub handshake_timeout: Duration,
    /// Read buffer size for accepted bytestreams
    pub read_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Sessions the relay will accept connections for (DST.ADDR -> session id).
#[derive(Debug, Clone, Default)]
pub struct RelayRegistry {
    sessions: Arc<DashMap<DstAddr, String>>,
}

impl RelayRegistry {
    /// Accept one connection for `dst` on behalf of session `sid`
    pub fn expect(&self, dst: DstAddr, sid: impl Into<String>) {
        self.sessions.insert(dst, sid.into());
    }

    /// Stop accepting connections for `dst`
    pub fn forget(&self, dst: &DstAddr) -> Option<String> {
        self.sessions.remove(dst).map(|(_, sid)| sid)
    }

    /// Number of sessions waiting for a connection
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn claim(&self, dst: &DstAddr) -> Option<String> {
        self.forget(dst)
    }
}

/// A bound, not yet running, local relay.
pub struct LocalRelay {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: RelayConfig,
    registry: RelayRegistry,
}

impl LocalRelay {
    /// Bind the relay listener.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ListenBindFailure` if the port cannot be
    /// bound. The bind is not retried on another port.
    pub async fn bind(addr: SocketAddr, config: RelayConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::ListenBindFailure {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(addr = %local_addr, "Local relay bound");

        Ok(Self {
            listener,
            local_addr,
            config,
            registry: RelayRegistry::default(),
        })
    }

    /// Address the relay is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session registry shared with the acceptor
    #[must_use]
    pub fn registry(&self) -> RelayRegistry {
        self.registry.clone()
    }

    /// Start the acceptor loop.
    ///
    /// `on_accept` is called with the session id and the ready bytestream
    /// for every matched connection. The loop runs until
    /// [`RelayHandle::shutdown`] is called or the handle is dropped.
    pub fn spawn<F>(self, on_accept: F) -> RelayHandle
    where
        F: Fn(String, Socks5Bytestream) + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let registry = self.registry.clone();
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.run(Arc::new(on_accept), shutdown_rx));

        RelayHandle {
            local_addr,
            registry,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run<F>(self, on_accept: Arc<F>, mut shutdown_rx: oneshot::Receiver<()>)
    where
        F: Fn(String, Socks5Bytestream) + Send + Sync + 'static,
    {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Relay accepted connection");
                        let registry = self.registry.clone();
                        let config = self.config.clone();
                        let on_accept = Arc::clone(&on_accept);
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_connection(stream, registry, config, on_accept).await
                            {
                                tracing::debug!(peer = %peer, error = %e, "Relay handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay accept failed");
                    }
                },
                _ = &mut shutdown_rx => {
                    tracing::info!(addr = %self.local_addr, "Local relay shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection<F>(
        mut stream: TcpStream,
        registry: RelayRegistry,
        config: RelayConfig,
        on_accept: Arc<F>,
    ) -> TransportResult<()>
    where
        F: Fn(String, Socks5Bytestream) + Send + Sync + 'static,
    {
        let dst = tokio::time::timeout(config.handshake_timeout, socks5::accept_request(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout("relay handshake".to_string()))??;

        let Some(sid) = registry.claim(&dst) else {
            socks5::send_reply(&mut stream, REPLY_HOST_UNREACHABLE, None).await?;
            return Err(TransportError::Handshake(format!(
                "unknown destination {}",
                dst.short()
            )));
        };

        socks5::send_reply(&mut stream, REPLY_SUCCESS, Some(&dst)).await?;
        stream.set_nodelay(true)?;

        tracing::info!(sid = %sid, dst = %dst.short(), "Relay bytestream ready");
        on_accept(sid, Socks5Bytestream::new(stream, None, config.read_buffer_size));
        Ok(())
    }
}

/// Handle to a running relay acceptor.
pub struct RelayHandle {
    local_addr: SocketAddr,
    registry: RelayRegistry,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Address the relay is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session registry shared with the acceptor
    #[must_use]
    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    /// Signal the acceptor to stop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
