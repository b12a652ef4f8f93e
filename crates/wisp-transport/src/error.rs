//! Transport layer errors.

use std::fmt;
use std::io;

/// Why a single stream-host candidate could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    /// Identity of the stream host that was tried
    pub host: String,
    /// `address:port` that was dialed
    pub endpoint: String,
    /// Human-readable failure reason
    pub reason: String,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.host, self.endpoint, self.reason)
    }
}

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Transport has not been connected yet
    #[error("Transport is not connected")]
    NotConnected,

    /// The relay listener could not bind its port
    #[error("Failed to bind relay listener on {addr}: {source}")]
    ListenBindFailure {
        /// Address the relay tried to bind
        addr: String,
        /// Underlying bind error
        #[source]
        source: io::Error,
    },

    /// TCP connection to a stream host failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SOCKS5 handshake failed or the peer violated the protocol
    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Every stream-host candidate failed
    #[error("No usable stream host candidate ({} tried)", attempts.len())]
    NoUsableCandidate {
        /// Per-candidate failures, in trial order
        attempts: Vec<CandidateFailure>,
    },
}

impl TransportError {
    /// Returns true if this error is a candidate-trial exhaustion
    #[must_use]
    pub fn is_no_usable_candidate(&self) -> bool {
        matches!(self, TransportError::NoUsableCandidate { .. })
    }

    /// Returns true if this error is a relay bind failure
    #[must_use]
    pub fn is_bind_failure(&self) -> bool {
        matches!(self, TransportError::ListenBindFailure { .. })
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
