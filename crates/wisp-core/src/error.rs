//! Error types for WISP core
//!
//! Every error maps to one [`ErrorKind`], the classification reported in
//! status lines and used by the drivers to decide the exit status.
//!
//! # Error Kinds
//!
//! - **Negotiation**: the offer was invalid, rejected, or timed out
//! - **Transport**: no candidate worked, the relay could not bind, or the
//!   channel failed mid-transfer
//! - **Integrity**: the received file is short or its hash disagrees
//! - **Internal**: state machine violations and local I/O

use crate::policy::RejectReason;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use wisp_transport::TransportError;

/// Errors that can occur in WISP core operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // ============ Negotiation Errors ============
    /// Offer failed local validation before anything was sent
    #[error("Invalid offer: {0}")]
    OfferInvalid(Cow<'static, str>),

    /// Peer declined the offer
    #[error("Offer rejected by peer: {0}")]
    NegotiationRejected(RejectReason),

    /// Session did not reach the data phase in time
    #[error("Negotiation timed out after {}s", .0.as_secs())]
    NegotiationTimeout(Duration),

    // ============ Transport Errors ============
    /// Every stream-host candidate failed
    #[error("No usable stream host: {0}")]
    NoUsableCandidate(String),

    /// The local relay could not bind its port
    #[error("Relay bind failed: {0}")]
    ListenBindFailure(String),

    /// Bytestream failed during establishment or transfer
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Signaling connection dropped or the peer went away
    #[error("Connection lost: {0}")]
    ConnectionLost(Cow<'static, str>),

    // ============ Transfer Errors ============
    /// Received data does not match the offer (short file, hash mismatch)
    #[error("Integrity check failed: {0}")]
    Integrity(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    // ============ State Errors ============
    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// No session with this id
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Manager is shutting down and refuses new work
    #[error("Shutting down")]
    ShuttingDown,

    /// Signaling layer failure
    #[error("Signaling error: {0}")]
    Signaling(Cow<'static, str>),

    /// Worker ended without reporting a result
    #[error("Internal error: {0}")]
    Internal(Cow<'static, str>),
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Offer failed validation
    OfferInvalid,
    /// Peer rejected the offer
    NegotiationRejected,
    /// Every candidate failed
    NoUsableCandidate,
    /// Bytestream failure
    TransportError,
    /// Relay listener could not bind
    ListenBindFailure,
    /// Signaling connection lost
    ConnectionLost,
    /// Negotiation did not complete in time
    NegotiationTimeout,
    /// Received data is incomplete or corrupt
    Integrity,
    /// Everything else
    Internal,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OfferInvalid(_) => ErrorKind::OfferInvalid,
            Error::NegotiationRejected(_) => ErrorKind::NegotiationRejected,
            Error::NegotiationTimeout(_) => ErrorKind::NegotiationTimeout,
            Error::NoUsableCandidate(_) => ErrorKind::NoUsableCandidate,
            Error::ListenBindFailure(_) => ErrorKind::ListenBindFailure,
            Error::Transport(_) => ErrorKind::TransportError,
            Error::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Io(_)
            | Error::InvalidState(_)
            | Error::UnknownSession(_)
            | Error::ShuttingDown
            | Error::Signaling(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Create an invalid offer error with static context (zero allocation)
    #[must_use]
    pub const fn offer_invalid(context: &'static str) -> Self {
        Error::OfferInvalid(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Error::InvalidState(Cow::Borrowed(context))
    }

    /// Create a connection lost error with static context (zero allocation)
    #[must_use]
    pub const fn connection_lost(context: &'static str) -> Self {
        Error::ConnectionLost(Cow::Borrowed(context))
    }

    /// Create an integrity error with static context (zero allocation)
    #[must_use]
    pub const fn integrity(context: &'static str) -> Self {
        Error::Integrity(Cow::Borrowed(context))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoUsableCandidate { attempts } => {
                let summary = attempts
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                if summary.is_empty() {
                    Error::NoUsableCandidate("no candidates".to_string())
                } else {
                    Error::NoUsableCandidate(summary)
                }
            }
            err @ TransportError::ListenBindFailure { .. } => {
                Error::ListenBindFailure(err.to_string())
            }
            other => Error::Transport(Cow::Owned(other.to_string())),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type for WISP core operations
pub type Result<T> = std::result::Result<T, Error>;
