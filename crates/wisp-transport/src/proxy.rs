//! Pairing proxy: a third-party SOCKS5 stream host.
//!
//! Both peers connect with the same destination address. The first leg is
//! granted immediately and parked; when the second leg arrives the two are
//! joined and bytes are copied in both directions until either side closes.
//! A parked leg that is not paired within the pairing timeout is closed.

use crate::candidate::DstAddr;
use crate::error::{TransportError, TransportResult};
use crate::socks5::{self, REPLY_GENERAL_FAILURE, REPLY_SUCCESS};
use crate::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PAIR_TIMEOUT};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Pairing proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long the first leg waits for its partner
    pub pair_timeout: Duration,
    /// Timeout for an inbound SOCKS5 handshake
    pub handshake_timeout: Duration,
    /// Maximum number of parked legs
    pub max_pending: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pair_timeout: DEFAULT_PAIR_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_pending: 1024,
        }
    }
}

/// SOCKS5 pairing proxy
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Parked first legs (DST.ADDR -> partner slot)
    pending: Arc<DashMap<DstAddr, oneshot::Sender<TcpStream>>>,
    config: ProxyConfig,
}

impl ProxyServer {
    /// Bind a proxy with default configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        Self::bind_with_config(addr, ProxyConfig::default()).await
    }

    /// Bind a proxy with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(addr: SocketAddr, config: ProxyConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::ListenBindFailure {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            pending: Arc::new(DashMap::new()),
            config,
        })
    }

    /// Address the proxy is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of legs waiting for a partner
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run the accept loop.
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; accept errors are logged.
    pub async fn run(&self) -> TransportResult<()> {
        tracing::info!(addr = %self.local_addr, "Pairing proxy listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let pending = Arc::clone(&self.pending);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_leg(stream, peer, pending, config).await {
                            tracing::debug!(peer = %peer, error = %e, "Proxy leg failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Proxy accept failed");
                }
            }
        }
    }

    async fn handle_leg(
        mut stream: TcpStream,
        peer: SocketAddr,
        pending: Arc<DashMap<DstAddr, oneshot::Sender<TcpStream>>>,
        config: ProxyConfig,
    ) -> TransportResult<()> {
        let dst = tokio::time::timeout(config.handshake_timeout, socks5::accept_request(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout("proxy handshake".to_string()))??;

        if !pending.contains_key(&dst) && pending.len() >= config.max_pending {
            socks5::send_reply(&mut stream, REPLY_GENERAL_FAILURE, None).await?;
            return Err(TransportError::ConnectionFailed(
                "too many unpaired legs".to_string(),
            ));
        }

        let claimed = match pending.entry(dst.clone()) {
            Entry::Occupied(entry) => Ok(entry.remove()),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                Err(rx)
            }
        };

        // Both legs receive the success reply before any payload flows.
        socks5::send_reply(&mut stream, REPLY_SUCCESS, Some(&dst)).await?;

        let (mut first, mut rx) = match claimed {
            Ok(partner) => match partner.send(stream) {
                Ok(()) => {
                    tracing::info!(dst = %dst.short(), peer = %peer, "Proxy legs paired");
                    return Ok(());
                }
                // Partner gave up between lookup and handoff; park instead
                Err(returned) => {
                    let (tx, rx) = oneshot::channel();
                    pending.insert(dst.clone(), tx);
                    (returned, rx)
                }
            },
            Err(rx) => {
                tracing::debug!(dst = %dst.short(), peer = %peer, "Proxy leg parked");
                (stream, rx)
            }
        };

        let mut second = match tokio::time::timeout(config.pair_timeout, &mut rx).await {
            Ok(Ok(partner)) => partner,
            Ok(Err(_)) => {
                return Err(TransportError::Closed);
            }
            Err(_) => {
                rx.close();
                match rx.try_recv() {
                    Ok(partner) => partner,
                    Err(_) => {
                        pending.remove_if(&dst, |_, tx| tx.is_closed());
                        tracing::info!(dst = %dst.short(), "Proxy leg not paired in time");
                        return Err(TransportError::Timeout("proxy pairing".to_string()));
                    }
                }
            }
        };

        match tokio::io::copy_bidirectional(&mut first, &mut second).await {
            Ok((up, down)) => {
                tracing::info!(
                    dst = %dst.short(),
                    bytes_first = up,
                    bytes_second = down,
                    "Proxy bytestream finished"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
