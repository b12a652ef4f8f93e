//! Transfer sessions and the negotiation state machine.
//!
//! ```text
//! Offered ──▶ Accepted ──▶ TransportPending ──▶ TransportReady ──▶ DataPhase ──▶ Closed
//!    │
//!    └──▶ Rejected
//! ```
//!
//! `Closed` is also reachable from every non-terminal state on failure, with
//! the error recorded on the session.

use crate::error::{Error, Result};
use crate::offer::TransferOffer;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Instant;
use wisp_transport::{DstAddr, SharedBytestream, StreamHostCandidate, Strategy};

/// Maximum accepted length of a peer-supplied session id
const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque session identifier, unique per negotiation.
///
/// Locally generated ids are 16 random bytes in lowercase hex. Ids read
/// from the wire go through [`SessionId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept a session id chosen by a peer.
    ///
    /// Returns `None` for empty, overlong, or non-printable ids.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        valid.then(|| Self(raw.to_string()))
    }

    /// The id as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid session id ({} bytes)", raw.len()))
    }
}

impl From<SessionId> for String {
    fn from(sid: SessionId) -> Self {
        sid.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the resource part of an identity (`user@host/resource` -> `user@host`).
#[must_use]
pub fn bare_identity(identity: &str) -> &str {
    identity.split_once('/').map_or(identity, |(bare, _)| bare)
}

/// Which side of the negotiation we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sent the offer (file sender)
    Initiator,
    /// Received the offer (file receiver)
    Target,
}

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Offer sent or received, awaiting a decision
    Offered,
    /// Offer accepted
    Accepted,
    /// Establishing a bytestream
    TransportPending,
    /// A bytestream is bound to the session
    TransportReady,
    /// A worker is moving data
    DataPhase,
    /// Finished, successfully or not
    Closed,
    /// Offer declined
    Rejected,
}

impl NegotiationState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Rejected)
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, to: NegotiationState) -> bool {
        use NegotiationState::*;

        match (self, to) {
            // Failure closes any live session
            (Offered | Accepted | TransportPending | TransportReady | DataPhase, Closed) => true,

            (Offered, Accepted | Rejected) => true,
            (Accepted, TransportPending) => true,
            (TransportPending, TransportReady) => true,
            (TransportReady, DataPhase) => true,

            // All other transitions invalid
            _ => false,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The bytestream bound to a session
#[derive(Clone)]
pub struct BoundTransport {
    /// Stream host the channel runs through, if dialed
    pub host: Option<StreamHostCandidate>,
    /// How the channel was established
    pub strategy: Strategy,
    /// The channel itself
    pub transport: SharedBytestream,
}

impl fmt::Debug for BoundTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundTransport")
            .field("host", &self.host)
            .field("strategy", &self.strategy)
            .field("open", &self.transport.is_open())
            .finish()
    }
}

/// A single file-transfer negotiation
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    role: Role,
    local: String,
    peer: String,
    offer: TransferOffer,
    candidates: Vec<StreamHostCandidate>,
    state: NegotiationState,
    bound: Option<BoundTransport>,
    error: Option<Error>,
    created_at: Instant,
}

impl Session {
    /// Create a session in `Offered`
    pub fn new(
        id: SessionId,
        role: Role,
        local: impl Into<String>,
        peer: impl Into<String>,
        offer: TransferOffer,
        candidates: Vec<StreamHostCandidate>,
    ) -> Self {
        Self {
            id,
            role,
            local: local.into(),
            peer: peer.into(),
            offer,
            candidates,
            state: NegotiationState::Offered,
            bound: None,
            error: None,
            created_at: Instant::now(),
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Our role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Our identity
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The other peer's identity
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The offer under negotiation
    #[must_use]
    pub fn offer(&self) -> &TransferOffer {
        &self.offer
    }

    /// Stream-host candidates in preference order
    #[must_use]
    pub fn candidates(&self) -> &[StreamHostCandidate] {
        &self.candidates
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Bound transport, if any
    #[must_use]
    pub fn bound(&self) -> Option<&BoundTransport> {
        self.bound.as_ref()
    }

    /// Error recorded when the session closed
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Time since the session was created
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Identity of the initiator
    #[must_use]
    pub fn initiator(&self) -> &str {
        match self.role {
            Role::Initiator => &self.local,
            Role::Target => &self.peer,
        }
    }

    /// Identity of the target
    #[must_use]
    pub fn target(&self) -> &str {
        match self.role {
            Role::Initiator => &self.peer,
            Role::Target => &self.local,
        }
    }

    /// SOCKS5 destination address for this session
    #[must_use]
    pub fn dst_addr(&self) -> DstAddr {
        DstAddr::derive(self.id.as_str(), self.initiator(), self.target())
    }

    /// Whether the session finished without error
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == NegotiationState::Closed && self.error.is_none()
    }

    /// Transition to `next`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the transition is not allowed
    pub fn transition_to(&mut self, next: NegotiationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(Cow::Owned(format!(
                "{} -> {} for session {}",
                self.state,
                next,
                self.id.short()
            ))));
        }

        tracing::debug!(
            sid = %self.id.short(),
            from = %self.state,
            to = %next,
            "Session state transition"
        );
        self.state = next;
        Ok(())
    }

    /// Bind a transport and move to `TransportReady`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if a transport is already bound or the
    /// session is not waiting for one
    pub fn bind(&mut self, bound: BoundTransport) -> Result<()> {
        if self.bound.is_some() {
            return Err(Error::invalid_state("transport already bound"));
        }
        self.transition_to(NegotiationState::TransportReady)?;
        self.bound = Some(bound);
        Ok(())
    }

    /// Close the session, recording `error` if it failed.
    ///
    /// Returns false if the session was already terminal.
    pub fn close(&mut self, error: Option<Error>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.error = error;
        true
    }

    /// Drop the bound transport of a terminal session.
    ///
    /// Returns `None` while the session is still live.
    pub fn release_transport(&mut self) -> Option<BoundTransport> {
        if self.state.is_terminal() {
            self.bound.take()
        } else {
            None
        }
    }

    /// Mark the offer as declined
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless the session is `Offered`
    pub fn reject(&mut self, error: Option<Error>) -> Result<()> {
        self.transition_to(NegotiationState::Rejected)?;
        self.error = error;
        Ok(())
    }
}
