//! Ordered candidate trial.

use crate::bytestream::{Bytestream, Received, SharedBytestream, TransportStats};
use crate::candidate::{DstAddr, StreamHostCandidate};
use crate::connector::Connector;
use crate::error::{CandidateFailure, TransportError, TransportResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Tries stream-host candidates strictly in listed order.
///
/// The first successful handshake wins and later candidates are never
/// attempted. When every candidate fails (or there are none) the result is
/// [`TransportError::NoUsableCandidate`] carrying each failure reason.
#[derive(Clone)]
pub struct CandidateTrial {
    candidates: Vec<StreamHostCandidate>,
    dst: DstAddr,
    connector: Arc<dyn Connector>,
}

impl CandidateTrial {
    /// Create a trial over `candidates` for session address `dst`
    pub fn new(
        candidates: Vec<StreamHostCandidate>,
        dst: DstAddr,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            candidates,
            dst,
            connector,
        }
    }

    /// Candidates in trial order
    #[must_use]
    pub fn candidates(&self) -> &[StreamHostCandidate] {
        &self.candidates
    }

    /// Run the trial.
    ///
    /// # Errors
    /// Returns `TransportError::NoUsableCandidate` if no candidate succeeds
    pub async fn run(&self) -> TransportResult<SharedBytestream> {
        let mut attempts = Vec::with_capacity(self.candidates.len());

        for (index, candidate) in self.candidates.iter().enumerate() {
            tracing::debug!(
                dst = %self.dst.short(),
                attempt = index + 1,
                total = self.candidates.len(),
                host = %candidate.host_identity,
                "Trying stream host"
            );

            match self.connector.connect(candidate, &self.dst).await {
                Ok(stream) => {
                    tracing::info!(
                        dst = %self.dst.short(),
                        host = %candidate.host_identity,
                        "Stream host connected"
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        dst = %self.dst.short(),
                        host = %candidate.host_identity,
                        error = %e,
                        "Stream host failed"
                    );
                    attempts.push(CandidateFailure {
                        host: candidate.host_identity.clone(),
                        endpoint: candidate.endpoint(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(TransportError::NoUsableCandidate { attempts })
    }
}

/// A bytestream whose `connect()` runs a candidate trial.
///
/// Until `connect()` succeeds every data operation fails with
/// [`TransportError::NotConnected`].
pub struct CandidateBytestream {
    trial: CandidateTrial,
    inner: OnceCell<SharedBytestream>,
}

impl CandidateBytestream {
    /// Create an unconnected bytestream over `trial`
    #[must_use]
    pub fn new(trial: CandidateTrial) -> Self {
        Self {
            trial,
            inner: OnceCell::new(),
        }
    }

    /// The established stream, once connected
    #[must_use]
    pub fn established(&self) -> Option<SharedBytestream> {
        self.inner.get().cloned()
    }

    fn connected(&self) -> TransportResult<&SharedBytestream> {
        self.inner.get().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Bytestream for CandidateBytestream {
    async fn connect(&self) -> TransportResult<()> {
        self.inner.get_or_try_init(|| self.trial.run()).await?;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> TransportResult<()> {
        self.connected()?.send(data).await
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Received> {
        self.connected()?.receive(timeout).await
    }

    fn is_open(&self) -> bool {
        self.inner.get().is_some_and(|inner| inner.is_open())
    }

    async fn close(&self) -> TransportResult<()> {
        match self.inner.get() {
            Some(inner) => inner.close().await,
            None => Ok(()),
        }
    }

    fn stream_host(&self) -> Option<&StreamHostCandidate> {
        self.inner.get().and_then(|inner| inner.stream_host())
    }

    fn stats(&self) -> TransportStats {
        self.inner
            .get()
            .map(|inner| inner.stats())
            .unwrap_or_default()
    }
}
