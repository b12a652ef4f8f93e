//! In-memory bytestreams and a scripted connector.
//!
//! Used by tests and in-process transfers where both ends live in the same
//! runtime.

use crate::bytestream::{Bytestream, Received, SharedBytestream, StatsCounter, TransportStats};
use crate::candidate::{DstAddr, StreamHostCandidate};
use crate::connector::Connector;
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

/// Chunks buffered per direction before `send()` waits.
const CHANNEL_DEPTH: usize = 64;

/// One end of an in-memory bytestream.
pub struct MemoryBytestream {
    tx: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    peer_eof: AtomicBool,
    stream_host: Option<StreamHostCandidate>,
    stats: StatsCounter,
}

/// Create a connected pair of in-memory bytestreams.
///
/// Bytes sent on one end are received on the other; closing either end is
/// observed by the peer as [`Received::Closed`].
#[must_use]
pub fn pair(stream_host: Option<StreamHostCandidate>) -> (MemoryBytestream, MemoryBytestream) {
    let (a_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (b_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        MemoryBytestream::new(a_tx, a_rx, stream_host.clone()),
        MemoryBytestream::new(b_tx, b_rx, stream_host),
    )
}

impl MemoryBytestream {
    fn new(
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        stream_host: Option<StreamHostCandidate>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed,
            peer_eof: AtomicBool::new(false),
            stream_host,
            stats: StatsCounter::default(),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait]
impl Bytestream for MemoryBytestream {
    async fn connect(&self) -> TransportResult<()> {
        if *self.closed.borrow() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, data: &[u8]) -> TransportResult<()> {
        let mut closed = self.closed.subscribe();
        let Some(tx) = self.sender() else {
            return Err(TransportError::Closed);
        };

        let sent = tokio::select! {
            sent = tx.send(data.to_vec()) => sent.is_ok(),
            _ = closed.wait_for(|closed| *closed) => false,
        };

        if sent {
            self.stats.record_send(data.len());
            Ok(())
        } else {
            self.stats.record_send_error();
            Err(TransportError::Closed)
        }
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Received> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() || self.peer_eof.load(Ordering::Acquire) {
            return Ok(Received::Closed);
        }

        let received = tokio::select! {
            received = tokio::time::timeout(timeout, async {
                self.rx.lock().await.recv().await
            }) => received,
            _ = closed.wait_for(|closed| *closed) => return Ok(Received::Closed),
        };

        match received {
            Err(_elapsed) => Ok(Received::Timeout),
            Ok(Some(data)) => {
                self.stats.record_recv(data.len());
                Ok(Received::Data(data))
            }
            Ok(None) => {
                self.peer_eof.store(true, Ordering::Release);
                Ok(Received::Closed)
            }
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.peer_eof.load(Ordering::Acquire)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        Ok(())
    }

    fn stream_host(&self) -> Option<&StreamHostCandidate> {
        self.stream_host.as_ref()
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

enum Script {
    Fail(String),
    Succeed(SharedBytestream),
    Hang,
}

/// A [`Connector`] with per-host scripted outcomes.
///
/// Hosts without a script fail with a connection error. Every attempt is
/// recorded in order.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: DashMap<String, Script>,
    attempts: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    /// Create a connector with no scripts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections to `host` fail with `reason`
    pub fn fail(&self, host: impl Into<String>, reason: impl Into<String>) {
        self.scripts.insert(host.into(), Script::Fail(reason.into()));
    }

    /// Hand out `stream` on the next connection to `host`
    pub fn succeed(&self, host: impl Into<String>, stream: impl Bytestream + 'static) {
        self.scripts
            .insert(host.into(), Script::Succeed(Arc::new(stream)));
    }

    /// Make connections to `host` never complete
    pub fn hang(&self, host: impl Into<String>) {
        self.scripts.insert(host.into(), Script::Hang);
    }

    /// Hosts attempted so far, in order
    pub async fn attempts(&self) -> Vec<String> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        candidate: &StreamHostCandidate,
        _dst: &DstAddr,
    ) -> TransportResult<SharedBytestream> {
        self.attempts
            .lock()
            .await
            .push(candidate.host_identity.clone());

        let host = &candidate.host_identity;
        if let Some((_, Script::Succeed(stream))) = self
            .scripts
            .remove_if(host, |_, script| matches!(script, Script::Succeed(_)))
        {
            return Ok(stream);
        }

        let failure = self.scripts.get(host).map(|script| match script.value() {
            Script::Fail(reason) => Some(reason.clone()),
            _ => None,
        });
        match failure {
            Some(Some(reason)) => Err(TransportError::ConnectionFailed(reason)),
            Some(None) => std::future::pending().await,
            None => Err(TransportError::ConnectionFailed(format!(
                "no route to {}",
                candidate.endpoint()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_bytes() {
        let (a, b) = pair(None);

        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();
        b.send(b"back").await.unwrap();

        let wait = Duration::from_secs(1);
        assert_eq!(b.receive(wait).await.unwrap(), Received::Data(b"one".to_vec()));
        assert_eq!(b.receive(wait).await.unwrap(), Received::Data(b"two".to_vec()));
        assert_eq!(a.receive(wait).await.unwrap(), Received::Data(b"back".to_vec()));
        assert_eq!(a.stats().chunks_sent, 2);
        assert_eq!(b.stats().bytes_received, 6);
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (a, b) = pair(None);

        a.send(b"last").await.unwrap();
        a.close().await.unwrap();
        assert!(!a.is_open());
        assert!(a.send(b"more").await.is_err());

        let wait = Duration::from_secs(1);
        assert_eq!(b.receive(wait).await.unwrap(), Received::Data(b"last".to_vec()));
        assert_eq!(b.receive(wait).await.unwrap(), Received::Closed);
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let (_a, b) = pair(None);
        assert_eq!(
            b.receive(Duration::from_millis(10)).await.unwrap(),
            Received::Timeout
        );
    }

    #[tokio::test]
    async fn test_scripted_unknown_host_fails() {
        let connector = ScriptedConnector::new();
        let candidate = StreamHostCandidate::new("nobody", "10.0.0.1", 1);
        let dst = DstAddr::derive("s", "i", "t");

        let err = connector.connect(&candidate, &dst).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert_eq!(connector.attempts().await, vec!["nobody"]);
    }

    #[tokio::test]
    async fn test_scripted_hang_never_completes() {
        let connector = ScriptedConnector::new();
        connector.hang("slow");
        let candidate = StreamHostCandidate::new("slow", "10.0.0.1", 1);
        let dst = DstAddr::derive("s", "i", "t");

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            connector.connect(&candidate, &dst),
        )
        .await;
        assert!(result.is_err());
    }
}
