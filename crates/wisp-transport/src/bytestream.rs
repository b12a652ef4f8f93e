//! Bytestream trait and the TCP-backed SOCKS5 implementation.
//!
//! A bytestream is the ordered, reliable byte channel bound to one
//! negotiated session. Methods take `&self` so one handle can be shared by
//! the worker moving data and the owner that may need to close it; closing
//! is the only way to cancel an in-flight transfer.

use crate::candidate::StreamHostCandidate;
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};

/// Outcome of a single `receive()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Bytes arrived, in stream order
    Data(Vec<u8>),
    /// Nothing arrived within the timeout; the channel is still open
    Timeout,
    /// The channel was closed by either side
    Closed,
}

/// Async bytestream abstraction.
///
/// Implemented by TCP streams established through SOCKS5 and by in-memory
/// pairs used in tests.
#[async_trait]
pub trait Bytestream: Send + Sync {
    /// Establish the channel.
    ///
    /// Streams produced by a connector or relay are already established and
    /// return `Ok(())` while open.
    ///
    /// # Errors
    /// Returns `TransportError` if the channel cannot be established
    async fn connect(&self) -> TransportResult<()>;

    /// Write all of `data` to the channel.
    ///
    /// A `close()` issued while a chunk is being written takes effect once
    /// the chunk is out.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after `close()`, or an I/O error
    async fn send(&self, data: &[u8]) -> TransportResult<()>;

    /// Wait up to `timeout` for the next chunk of bytes.
    ///
    /// # Errors
    /// Returns `TransportError` on I/O failure
    async fn receive(&self, timeout: Duration) -> TransportResult<Received>;

    /// Whether the channel is usable for sending and receiving.
    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    ///
    /// # Errors
    /// Returns `TransportError` if the shutdown fails
    async fn close(&self) -> TransportResult<()>;

    /// The stream host this channel was established through, if known.
    fn stream_host(&self) -> Option<&StreamHostCandidate> {
        None
    }

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Shared handle to a bytestream
pub type SharedBytestream = Arc<dyn Bytestream>;

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total chunks sent
    pub chunks_sent: u64,
    /// Total chunks received
    pub chunks_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters behind a [`TransportStats`] snapshot.
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounter {
    /// Record a successful send
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// A TCP connection that has completed the SOCKS5 handshake.
pub struct Socks5Bytestream {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
    peer_eof: AtomicBool,
    stream_host: Option<StreamHostCandidate>,
    read_buffer_size: usize,
    stats: StatsCounter,
}

impl Socks5Bytestream {
    /// Wrap an established stream.
    ///
    /// `stream_host` is the candidate the stream was dialed through, or
    /// `None` for connections accepted by a local relay.
    #[must_use]
    pub fn new(
        stream: TcpStream,
        stream_host: Option<StreamHostCandidate>,
        read_buffer_size: usize,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed,
            peer_eof: AtomicBool::new(false),
            stream_host,
            read_buffer_size: read_buffer_size.max(1),
            stats: StatsCounter::default(),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Bytestream for Socks5Bytestream {
    async fn connect(&self) -> TransportResult<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, data: &[u8]) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        // A chunk is written whole; close() waits for the writer lock
        let result = writer.write_all(data).await.map_err(TransportError::from);
        drop(writer);

        match result {
            Ok(()) => {
                self.stats.record_send(data.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e)
            }
        }
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Received> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() || self.peer_eof.load(Ordering::Acquire) {
            return Ok(Received::Closed);
        }

        let mut buf = vec![0u8; self.read_buffer_size];
        let read = tokio::select! {
            read = tokio::time::timeout(timeout, async {
                let mut reader = self.reader.lock().await;
                reader.read(&mut buf).await
            }) => read,
            _ = closed.wait_for(|closed| *closed) => return Ok(Received::Closed),
        };

        match read {
            Err(_elapsed) => Ok(Received::Timeout),
            Ok(Ok(0)) => {
                self.peer_eof.store(true, Ordering::Release);
                Ok(Received::Closed)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                self.stats.record_recv(n);
                Ok(Received::Data(buf))
            }
            Ok(Err(e)) => {
                self.stats.record_recv_error();
                Err(e.into())
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.is_closed() && !self.peer_eof.load(Ordering::Acquire)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn stream_host(&self) -> Option<&StreamHostCandidate> {
        self.stream_host.as_ref()
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for Socks5Bytestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Bytestream")
            .field("open", &self.is_open())
            .field("stream_host", &self.stream_host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (Socks5Bytestream, Socks5Bytestream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            Socks5Bytestream::new(client.unwrap(), None, 1024),
            Socks5Bytestream::new(server.unwrap().0, None, 1024),
        )
    }

    #[test]
    fn test_transport_stats_counter() {
        let counter = StatsCounter::default();
        assert_eq!(counter.snapshot(), TransportStats::new());

        counter.record_send(100);
        counter.record_send(50);
        counter.record_recv(200);
        counter.record_send_error();
        counter.record_recv_error();

        let stats = counter.snapshot();
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.chunks_sent, 2);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.chunks_received, 1);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 1);
    }

    #[tokio::test]
    async fn test_send_receive() {
        let (a, b) = tcp_pair().await;

        a.send(b"hello").await.unwrap();
        let received = b.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Received::Data(b"hello".to_vec()));

        assert_eq!(a.stats().bytes_sent, 5);
        assert_eq!(b.stats().bytes_received, 5);
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let (_a, b) = tcp_pair().await;

        let received = b.receive(Duration::from_millis(20)).await.unwrap();
        assert_eq!(received, Received::Timeout);
        assert!(b.is_open());
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (a, b) = tcp_pair().await;

        a.close().await.unwrap();
        assert!(!a.is_open());
        assert!(matches!(a.send(b"x").await, Err(TransportError::Closed)));

        let received = b.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Received::Closed);
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = tcp_pair().await;
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_receive() {
        let (a, _b) = tcp_pair().await;
        let a = Arc::new(a);

        let reader = Arc::clone(&a);
        let pending =
            tokio::spawn(async move { reader.receive(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await.unwrap();

        let received = pending.await.unwrap().unwrap();
        assert_eq!(received, Received::Closed);
    }

    #[tokio::test]
    async fn test_close_lets_pending_chunk_finish() {
        const CHUNK: usize = 16 * 1024 * 1024;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let a = Arc::new(Socks5Bytestream::new(client.unwrap(), None, 64 * 1024));
        let b = Socks5Bytestream::new(server.unwrap().0, None, 64 * 1024);

        // Peer is not reading yet, so the write blocks part way through
        let writer = Arc::clone(&a);
        let pending = tokio::spawn(async move { writer.send(&vec![7u8; CHUNK]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closer = Arc::clone(&a);
        let closing = tokio::spawn(async move { closer.close().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut total = 0;
        loop {
            match b.receive(Duration::from_secs(5)).await.unwrap() {
                Received::Data(data) => total += data.len(),
                Received::Closed => break,
                Received::Timeout => panic!("stream stalled after {total} bytes"),
            }
        }

        assert_eq!(total, CHUNK);
        pending.await.unwrap().unwrap();
        closing.await.unwrap().unwrap();
        assert!(!a.is_open());
    }
}
